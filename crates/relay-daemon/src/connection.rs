//! One agent connection: `Connecting → Handshaking → Ready → Closed`.
//!
//! The first frame must be HELLO and must arrive within the heartbeat
//! timeout. After WELCOME the loop alternates between inbound frames and the
//! PING timer; an agent silent for `heartbeat_ms * multiplier` is dropped.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use relay_protocol::{Envelope, FrameParser, MessageType};
use relay_storage::ClosedBy;

use crate::router::{correlated, Flow, Router};
use crate::wire::{spawn_writer, FrameReader};
use crate::RouterResult;

/// How long a closing connection may take to drain its outbound queue.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one accepted stream until it closes.
pub async fn serve_connection<S>(stream: S, router: Router, peer: String) -> RouterResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = router.state().config.clone();
    let mode = config.frame_mode();
    let heartbeat = Duration::from_millis(config.heartbeat_ms.max(1));
    let timeout = Duration::from_millis(config.heartbeat_timeout_ms().max(1));

    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(
        reader,
        FrameParser::with_max_frame_bytes(mode, config.max_frame_bytes),
    );
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let writer_task = spawn_writer(writer, mode, rx);
    let conn_id = router.state().next_connection_id();

    // Handshaking
    let hello = match tokio::time::timeout(timeout, frames.next()).await {
        Ok(Ok(Some(envelope))) => envelope,
        Ok(Ok(None)) => {
            tracing::debug!(peer = %peer, "Closed before HELLO");
            drop(tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
            return Ok(());
        }
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Unreadable first frame");
            let _ = tx.send(Envelope::error(e.code(), e.to_string(), true));
            drop(tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
            return Err(e);
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "Handshake timed out");
            drop(tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
            return Ok(());
        }
    };

    let session = match router.admit(hello, conn_id, tx.clone()).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(peer = %peer, code = e.code(), error = %e, "Handshake rejected");
            let _ = tx.send(Envelope::error(e.code(), e.to_string(), true));
            drop(tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
            return Ok(());
        }
    };
    drop(tx);

    // Ready
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;
    let mut last_seen = Instant::now();

    let closed_by = loop {
        tokio::select! {
            next = frames.next() => match next {
                Ok(Some(envelope)) => {
                    last_seen = Instant::now();
                    let id = envelope.id.clone();
                    match router.handle(&session, envelope).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close(by)) => break by,
                        Err(e) => {
                            tracing::debug!(agent = %session.agent, code = e.code(), error = %e, "Envelope rejected");
                            session.reply(correlated(
                                Envelope::error(e.code(), e.to_string(), false),
                                &id,
                            ));
                        }
                    }
                }
                Ok(None) => break ClosedBy::Disconnect,
                Err(e) => {
                    tracing::warn!(agent = %session.agent, error = %e, "Framing error, closing connection");
                    session.reply(Envelope::error(e.code(), e.to_string(), true));
                    break ClosedBy::Error;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > timeout {
                    tracing::warn!(
                        agent = %session.agent,
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "Heartbeat timeout"
                    );
                    break ClosedBy::Disconnect;
                }
                session.reply(Envelope::new(MessageType::Ping, serde_json::Value::Null));
            }
        }
    };

    router.release(&session, closed_by).await;
    drop(session);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await;
    Ok(())
}
