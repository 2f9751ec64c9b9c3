//! Agent-side connection to a relay daemon.
//!
//! [`RelayClient`] performs the HELLO/WELCOME handshake, answers PINGs,
//! drops duplicate DELIVERs and routes correlated replies (ACK, NACK, BUSY,
//! SYNC, SPAWN_RESULT, ...) to whoever is waiting on them. Everything else
//! lands in the inbox read by [`RelayClient::recv`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use relay_coordination::{CoordinationError, CoordinationResult, MessageSink};
use relay_protocol::{
    now_ms, AckPayload, BusyPayload, ChannelPayload, DedupWindow, Envelope, ErrorPayload,
    FrameMode, FrameParser, HelloPayload, LogPayload, MessageType, NackPayload, PayloadMeta,
    ResumeRequest, SendPayload, ShadowBindPayload, SyncMeta, SyncPayload, SyncStream,
    WelcomePayload, MAX_FRAME_BYTES,
};

use crate::config::RelayAddr;
use crate::router::{channel_key, correlated};
use crate::wire::{spawn_writer, FrameReader};
use crate::{RouterError, RouterResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub agent: String,
    pub cli: Option<String>,
    pub project: Option<String>,
    pub capabilities: Vec<String>,
    pub resume_token: Option<String>,
    pub frame_mode: FrameMode,
    pub max_frame_bytes: usize,
    pub handshake_timeout: Duration,
}

impl ClientOptions {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            cli: None,
            project: None,
            capabilities: Vec::new(),
            resume_token: None,
            frame_mode: FrameMode::Current,
            max_frame_bytes: MAX_FRAME_BYTES,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = Some(cli.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    pub fn with_frame_mode(mut self, mode: FrameMode) -> Self {
        self.frame_mode = mode;
        self
    }

    fn hello(&self) -> RouterResult<Envelope> {
        let payload = HelloPayload {
            agent: self.agent.clone(),
            cli: self.cli.clone(),
            project: self.project.clone(),
            capabilities: self.capabilities.clone(),
            session: self.resume_token.as_ref().map(|token| ResumeRequest {
                resume_token: Some(token.clone()),
            }),
        };
        Ok(Envelope::with_payload(MessageType::Hello, &payload)?)
    }
}

pub struct RelayClient {
    agent: String,
    welcome: WelcomePayload,
    outbound: mpsc::UnboundedSender<Envelope>,
    waiters: Waiters,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Dial `addr` and handshake.
    pub async fn connect(addr: &RelayAddr, options: ClientOptions) -> RouterResult<Self> {
        match addr {
            RelayAddr::Unix(path) => Self::handshake(UnixStream::connect(path).await?, options).await,
            RelayAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Self::handshake(stream, options).await
            }
        }
    }

    /// Handshake over an already connected stream.
    pub async fn handshake<S>(stream: S, options: ClientOptions) -> RouterResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FrameReader::new(
            reader,
            FrameParser::with_max_frame_bytes(options.frame_mode, options.max_frame_bytes),
        );
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(writer, options.frame_mode, rx);

        outbound
            .send(options.hello()?)
            .map_err(|_| RouterError::Closed)?;

        let first = tokio::time::timeout(options.handshake_timeout, frames.next())
            .await
            .map_err(|_| RouterError::Timeout(options.handshake_timeout.as_millis() as u64))??
            .ok_or(RouterError::Closed)?;
        let welcome: WelcomePayload = match first.kind {
            MessageType::Welcome => first.payload_as()?,
            MessageType::Error => {
                let error: ErrorPayload = first.payload_as()?;
                return Err(RouterError::Rejected {
                    code: error.code,
                    message: error.message,
                });
            }
            other => {
                return Err(RouterError::Rejected {
                    code: "HANDSHAKE".into(),
                    message: format!("expected WELCOME, got {other}"),
                })
            }
        };
        tracing::debug!(agent = %options.agent, session_id = %welcome.session_id, "Connected to relay");

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            frames,
            outbound.clone(),
            Arc::clone(&waiters),
            inbox_tx,
            options.agent.clone(),
        ));

        Ok(Self {
            agent: options.agent,
            welcome,
            outbound,
            waiters,
            inbox: Mutex::new(inbox_rx),
            reader,
            writer: Some(writer),
        })
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn session_id(&self) -> &str {
        &self.welcome.session_id
    }

    /// Present in the next HELLO to resume this session.
    pub fn resume_token(&self) -> &str {
        &self.welcome.resume_token
    }

    pub fn welcome(&self) -> &WelcomePayload {
        &self.welcome
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.outbound.is_closed()
    }

    /// Next inbound envelope that is not a correlated reply. `None` once the
    /// connection is gone.
    pub async fn recv(&self) -> Option<Envelope> {
        self.inbox.lock().await.recv().await
    }

    /// Queue a raw envelope, stamping `from`.
    pub fn send_envelope(&self, mut envelope: Envelope) -> RouterResult<()> {
        envelope.from = Some(self.agent.clone());
        self.outbound.send(envelope).map_err(|_| RouterError::Closed)
    }

    /// Fire-and-forget SEND. Returns the envelope id.
    pub fn send(&self, to: &str, payload: &SendPayload) -> RouterResult<String> {
        let envelope = Envelope::send(to, payload)?;
        let id = envelope.id.clone();
        self.send_envelope(envelope)?;
        Ok(id)
    }

    /// Send `envelope` and wait for the reply correlated to its id.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> RouterResult<Envelope> {
        let id = envelope.id.clone();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.send_envelope(envelope) {
            self.waiters.lock().await.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RouterError::Closed),
            Err(_) => {
                self.waiters.lock().await.remove(&id);
                Err(RouterError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// SEND and block until the recipient ACKs it. NACK, BUSY and ERROR
    /// replies become errors; so does silence past `timeout`.
    pub async fn send_and_wait(
        &self,
        to: &str,
        payload: &SendPayload,
        timeout: Duration,
    ) -> RouterResult<AckPayload> {
        let mut envelope = Envelope::send(to, payload)?;
        envelope.payload_meta = Some(PayloadMeta {
            sync: Some(SyncMeta {
                correlation_id: envelope.id.clone(),
                timeout_ms: Some(timeout.as_millis() as u64),
                blocking: true,
            }),
            ..Default::default()
        });
        let reply = self.request(envelope, timeout).await?;
        match reply.kind {
            MessageType::Ack => Ok(reply.payload_as()?),
            MessageType::Nack => {
                let nack: NackPayload = reply.payload_as()?;
                Err(RouterError::Rejected {
                    code: nack.code,
                    message: nack.reason,
                })
            }
            MessageType::Busy => {
                let busy: BusyPayload = reply.payload_as()?;
                Err(RouterError::Busy {
                    retry_after_ms: busy.retry_after_ms,
                })
            }
            _ => Err(error_reply(&reply)),
        }
    }

    /// Acknowledge a DELIVER. `response` is returned to a blocked sender.
    pub fn ack(&self, deliver: &Envelope, response: Option<serde_json::Value>) -> RouterResult<()> {
        let payload = AckPayload {
            ack_id: deliver.id.clone(),
            seq: deliver.delivery.as_ref().map(|d| d.seq),
            correlation_id: deliver.correlation_id().map(str::to_string),
            response,
        };
        let mut envelope = Envelope::with_payload(MessageType::Ack, &payload)?;
        envelope.to = deliver.from.clone();
        self.send_envelope(envelope)
    }

    pub fn nack(&self, deliver: &Envelope, code: &str, reason: &str) -> RouterResult<()> {
        let payload = NackPayload {
            ack_id: deliver.id.clone(),
            code: code.to_string(),
            reason: reason.to_string(),
        };
        let mut envelope = Envelope::with_payload(MessageType::Nack, &payload)?;
        envelope.to = deliver.from.clone();
        if let Some(correlation_id) = deliver.correlation_id() {
            envelope = correlated(envelope, correlation_id);
        }
        self.send_envelope(envelope)
    }

    /// Tell a sender to back off.
    pub fn busy(&self, to: &str, retry_after_ms: u64, queue_depth: u64) -> RouterResult<()> {
        let payload = BusyPayload {
            retry_after_ms,
            queue_depth,
        };
        self.send_envelope(Envelope::with_payload(MessageType::Busy, &payload)?.to(to))
    }

    /// Replay anything newer than `streams` and return the server's view.
    pub async fn sync(&self, streams: Vec<SyncStream>) -> RouterResult<SyncPayload> {
        let request = SyncPayload {
            session_id: Some(self.welcome.session_id.clone()),
            streams,
            replayed: None,
        };
        let envelope = Envelope::with_payload(MessageType::Sync, &request)?;
        let reply = self.request(envelope, DEFAULT_REQUEST_TIMEOUT).await?;
        match reply.kind {
            MessageType::Sync => Ok(reply.payload_as()?),
            _ => Err(error_reply(&reply)),
        }
    }

    pub fn join_channel(&self, channel: &str) -> RouterResult<()> {
        self.channel_op(MessageType::ChannelJoin, channel)
    }

    pub fn leave_channel(&self, channel: &str) -> RouterResult<()> {
        self.channel_op(MessageType::ChannelLeave, channel)
    }

    fn channel_op(&self, kind: MessageType, channel: &str) -> RouterResult<()> {
        let payload = ChannelPayload {
            channel: channel_key(channel),
            member: None,
        };
        self.send_envelope(Envelope::with_payload(kind, &payload)?)
    }

    pub fn channel_message(&self, channel: &str, payload: &SendPayload) -> RouterResult<String> {
        let envelope = Envelope::with_payload(MessageType::ChannelMessage, payload)?.to(channel_key(channel));
        let id = envelope.id.clone();
        self.send_envelope(envelope)?;
        Ok(id)
    }

    pub fn shadow(&self, primary: &str) -> RouterResult<()> {
        let payload = ShadowBindPayload {
            primary_agent: primary.to_string(),
            receive_incoming: true,
            receive_outgoing: true,
        };
        self.send_envelope(Envelope::with_payload(MessageType::ShadowBind, &payload)?)
    }

    pub fn log(&self, data: impl Into<String>) -> RouterResult<()> {
        let payload = LogPayload { data: data.into() };
        self.send_envelope(Envelope::with_payload(MessageType::Log, &payload)?)
    }

    /// Graceful close; the daemon records `closed_by = agent`.
    pub fn bye(&self) -> RouterResult<()> {
        self.send_envelope(Envelope::new(MessageType::Bye, serde_json::Value::Null))
    }

    /// Say BYE and wait for queued frames to reach the socket.
    pub async fn close(mut self) -> RouterResult<()> {
        let result = self.bye();
        self.reader.abort();
        let _ = (&mut self.reader).await;
        let writer = self.writer.take();
        drop(self);
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer).await;
        }
        result
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn error_reply(reply: &Envelope) -> RouterError {
    match reply.payload_as::<ErrorPayload>() {
        Ok(error) => RouterError::Rejected {
            code: error.code,
            message: error.message,
        },
        Err(_) => RouterError::Rejected {
            code: "UNEXPECTED_REPLY".into(),
            message: format!("unexpected {} reply", reply.kind),
        },
    }
}

async fn read_loop<R>(
    mut frames: FrameReader<R>,
    outbound: mpsc::UnboundedSender<Envelope>,
    waiters: Waiters,
    inbox: mpsc::UnboundedSender<Envelope>,
    agent: String,
) where
    R: AsyncRead + Unpin,
{
    let mut dedup = DedupWindow::new();
    loop {
        let envelope = match frames.next().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::debug!(agent = %agent, "Relay closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(agent = %agent, error = %e, "Relay connection failed");
                break;
            }
        };

        match envelope.kind {
            MessageType::Ping => {
                let pong = correlated(
                    Envelope::new(MessageType::Pong, serde_json::Value::Null),
                    &envelope.id,
                );
                let _ = outbound.send(pong);
                continue;
            }
            MessageType::Deliver => {
                if !dedup.check_and_insert(&envelope.id, now_ms()) {
                    tracing::debug!(agent = %agent, id = %envelope.id, "Duplicate delivery dropped");
                    continue;
                }
            }
            _ => {
                // A DELIVER's correlation id belongs to its sender's request;
                // anything else carrying one is a reply.
                if let Some(correlation_id) = envelope.correlation_id() {
                    let waiter = waiters.lock().await.remove(correlation_id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(envelope);
                        continue;
                    }
                }
            }
        }

        let _ = inbox.send(envelope);
    }
    waiters.lock().await.clear();
}

/// Coordination components send through a live client.
#[async_trait]
impl MessageSink for RelayClient {
    async fn send_message(
        &self,
        to: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) -> CoordinationResult<()> {
        let payload = SendPayload {
            body: body.to_string(),
            data,
            ..Default::default()
        };
        self.send(to, &payload)
            .map(|_| ())
            .map_err(|e| CoordinationError::Transport(e.to_string()))
    }
}
