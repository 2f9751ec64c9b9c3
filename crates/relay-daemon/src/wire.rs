//! Frame-level I/O shared by daemon connections and clients.

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_protocol::{encode_with_mode, Envelope, FrameMode, FrameParser};

use crate::RouterResult;

const READ_CHUNK: usize = 16 * 1024;

/// Pulls whole envelopes off a byte stream.
///
/// `next` is cancel safe: bytes are only consumed by a completed read, and
/// decoded envelopes stay queued until returned.
pub(crate) struct FrameReader<R> {
    reader: R,
    parser: FrameParser,
    ready: VecDeque<Envelope>,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R, parser: FrameParser) -> Self {
        Self {
            reader,
            parser,
            ready: VecDeque::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Next envelope, or `None` on clean EOF.
    pub(crate) async fn next(&mut self) -> RouterResult<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.ready.pop_front() {
                return Ok(Some(envelope));
            }
            self.buf.clear();
            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.parser.buffered() > 0 {
                    tracing::debug!(bytes = self.parser.buffered(), "EOF inside a partial frame");
                }
                return Ok(None);
            }
            self.ready.extend(self.parser.push(&self.buf)?);
        }
    }
}

/// Drain `rx` onto `writer` until every sender is gone.
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    mode: FrameMode,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let frame = match encode_with_mode(&envelope, mode) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(
                        id = %envelope.id,
                        kind = %envelope.kind,
                        error = %e,
                        "Dropping envelope that cannot be framed"
                    );
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&frame).await {
                tracing::debug!(error = %e, "Write failed, closing writer");
                break;
            }
            if let Err(e) = writer.flush().await {
                tracing::debug!(error = %e, "Flush failed, closing writer");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}
