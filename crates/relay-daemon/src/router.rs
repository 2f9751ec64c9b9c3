//! Routing rules and per-envelope handling for handshaken connections.
//!
//! | `to`            | rule                                              |
//! |-----------------|---------------------------------------------------|
//! | agent name      | deliver if connected, otherwise store for replay  |
//! | `*`             | every connected agent except the sender           |
//! | `#channel`      | current channel members except the sender         |
//! | `project:agent` | handed to the configured project bridge           |
//!
//! The router never waits for an ACK. ACKs only update the stored status
//! and, for synchronous requests, travel back to the original sender.

use std::sync::Arc;

use tokio::sync::mpsc;

use relay_protocol::{
    now_ms, AckPayload, BusyPayload, ChannelPayload, DeliveryInfo, Envelope, HelloPayload,
    LifecycleResultPayload, LogPayload, MessageType, NackPayload, PayloadKind, PayloadMeta,
    ProtocolError, ReleasePayload, SendPayload, ServerInfo, ShadowBindPayload, SpawnPayload,
    SyncPayload, SyncStream, Target, WelcomePayload, BROADCAST_TARGET, CHANNEL_PREFIX,
    PROJECT_SEPARATOR, PROTOCOL_VERSION,
};
use relay_storage::{
    AgentSummary, ClosedBy, MessageQuery, MessageStatus, StoredMessage, StoredSession,
};

use crate::spawner;
use crate::state::{ConnectionHandle, DaemonState, PendingDelivery};
use crate::{RouterError, RouterResult};

/// What the connection loop should do after an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(ClosedBy),
}

/// A connection that completed the handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub agent: String,
    pub session_id: String,
    pub resume_token: String,
    pub conn_id: u64,
    pub project: Option<String>,
    pub resumed: bool,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl Session {
    /// Queue an envelope for this connection.
    pub fn reply(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            tracing::debug!(agent = %self.agent, "Reply dropped, connection closing");
        }
    }
}

/// Mark `envelope` as the answer to request `correlation_id`.
pub(crate) fn correlated(mut envelope: Envelope, correlation_id: &str) -> Envelope {
    let mut meta = envelope.payload_meta.take().unwrap_or_default();
    meta.correlation_id = Some(correlation_id.to_string());
    envelope.payload_meta = Some(meta);
    envelope
}

/// `general` and `#general` name the same channel.
pub fn channel_key(name: &str) -> String {
    if name.starts_with(CHANNEL_PREFIX) {
        name.to_string()
    } else {
        format!("{CHANNEL_PREFIX}{name}")
    }
}

/// Fan-out copies are stored as `<envelope id>:<recipient>`; DELIVER always
/// carries the bare envelope id so receivers can de-duplicate.
pub fn envelope_id_of(message: &StoredMessage) -> &str {
    let suffix = format!("{PROJECT_SEPARATOR}{}", message.to);
    message
        .id
        .strip_suffix(suffix.as_str())
        .unwrap_or(&message.id)
}

fn payload_kind(kind: &str) -> PayloadKind {
    serde_json::from_value(serde_json::Value::String(kind.to_string())).unwrap_or_default()
}

/// Build the DELIVER envelope for a stored message.
pub fn deliver_envelope(
    message: &StoredMessage,
    meta: Option<PayloadMeta>,
) -> Result<Envelope, ProtocolError> {
    let payload = SendPayload {
        kind: payload_kind(&message.kind),
        body: message.body.clone(),
        data: message.data.clone(),
        thread: message.thread.clone(),
    };
    let mut envelope = Envelope::with_payload(MessageType::Deliver, &payload)?
        .from(message.from.clone())
        .to(message.to.clone());
    envelope.id = envelope_id_of(message).to_string();
    envelope.ts = message.ts;
    envelope.topic = message.topic.clone();
    envelope.payload_meta = meta.or_else(|| {
        message.is_urgent.then(|| PayloadMeta {
            importance: Some(80),
            ..Default::default()
        })
    });
    envelope.delivery = message
        .delivery_seq
        .zip(message.delivery_session_id.clone())
        .map(|(seq, session_id)| DeliveryInfo { seq, session_id });
    Ok(envelope)
}

fn valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name != BROADCAST_TARGET
        && !name.starts_with(CHANNEL_PREFIX)
        && !name.contains(PROJECT_SEPARATOR)
        && !name.chars().any(char::is_whitespace)
}

#[derive(Clone)]
pub struct Router {
    state: Arc<DaemonState>,
}

impl Router {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    // -----------------------------------------------------------------------
    // Handshake and teardown
    // -----------------------------------------------------------------------

    /// Validate HELLO, register the connection, send WELCOME and flush
    /// anything stored for the agent. Any error means the connection must
    /// be closed with an ERROR carrying [`RouterError::code`].
    pub async fn admit(
        &self,
        hello: Envelope,
        conn_id: u64,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> RouterResult<Session> {
        if hello.kind != MessageType::Hello {
            return Err(RouterError::handshake(
                "HANDSHAKE_REQUIRED",
                format!("first frame must be HELLO, got {}", hello.kind),
            ));
        }
        if hello.v != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: hello.v,
                expected: PROTOCOL_VERSION,
            }
            .into());
        }
        let payload: HelloPayload = hello
            .payload_as()
            .map_err(|e| RouterError::handshake("MALFORMED_HELLO", e.to_string()))?;
        let agent = payload.agent.trim().to_string();
        if !valid_agent_name(&agent) {
            return Err(RouterError::handshake(
                "INVALID_AGENT_NAME",
                format!("'{agent}' cannot be used as an agent name"),
            ));
        }
        if self.state.config.is_banned(&agent) {
            return Err(RouterError::handshake(
                "BANNED",
                format!("agent '{agent}' is banned from this relay"),
            ));
        }

        let store = &self.state.store;
        let previous = match payload.session.as_ref().and_then(|s| s.resume_token.as_deref()) {
            Some(token) => store
                .get_session_by_resume_token(token)
                .await?
                .filter(|s| s.agent_name == agent),
            None => None,
        };
        let resumed = previous.is_some();
        let resume_token = uuid::Uuid::new_v4().to_string();
        let record = match previous {
            Some(prev) => StoredSession {
                cli: payload.cli.clone().or(prev.cli),
                project_id: payload.project.clone().or(prev.project_id),
                ended_at: None,
                closed_by: None,
                resume_token: Some(resume_token.clone()),
                ..prev
            },
            None => StoredSession {
                id: uuid::Uuid::new_v4().to_string(),
                agent_name: agent.clone(),
                cli: payload.cli.clone(),
                project_id: payload.project.clone(),
                started_at: now_ms(),
                ended_at: None,
                message_count: 0,
                resume_token: Some(resume_token.clone()),
                closed_by: None,
            },
        };

        let gate = self.state.gate(&agent).await;
        let _delivery = gate.lock().await;

        self.state
            .register(ConnectionHandle {
                conn_id,
                agent: agent.clone(),
                session_id: record.id.clone(),
                project: record.project_id.clone(),
                outbound: outbound.clone(),
                connected_at: now_ms(),
            })
            .await?;
        if let Err(e) = store.start_session(&record).await {
            self.state.unregister(&agent, conn_id).await;
            return Err(e.into());
        }

        let session = Session {
            agent,
            session_id: record.id,
            resume_token,
            conn_id,
            project: record.project_id,
            resumed,
            outbound,
        };
        self.touch_summary(&session, None).await;

        let welcome = WelcomePayload {
            session_id: session.session_id.clone(),
            resume_token: session.resume_token.clone(),
            server: ServerInfo {
                max_frame_bytes: self.state.config.max_frame_bytes,
                heartbeat_ms: self.state.config.heartbeat_ms,
            },
        };
        session.reply(
            correlated(Envelope::with_payload(MessageType::Welcome, &welcome)?, &hello.id)
                .to(session.agent.clone()),
        );
        tracing::info!(
            agent = %session.agent,
            session_id = %session.session_id,
            cli = payload.cli.as_deref().unwrap_or("-"),
            resumed,
            "Agent connected"
        );

        let flushed = self.flush_pending(&session).await?;
        if flushed > 0 {
            tracing::info!(agent = %session.agent, count = flushed, "Flushed pending messages");
        }
        Ok(session)
    }

    /// Must be called with the agent's delivery gate held.
    async fn flush_pending(&self, session: &Session) -> RouterResult<usize> {
        let pending = self
            .state
            .store
            .get_pending_messages_for_session(&session.agent, Some(&session.session_id))
            .await?;
        let count = pending.len();
        for mut message in pending {
            let delivered_here = message.delivery_seq.is_some()
                && message.delivery_session_id.as_deref() == Some(session.session_id.as_str());
            if !delivered_here {
                let seq = self
                    .state
                    .next_seq(&message.to, message.topic_or_default(), &message.from)
                    .await?;
                message.delivery_seq = Some(seq);
                message.delivery_session_id = Some(session.session_id.clone());
                self.state.store.save_message(&message).await?;
            }
            session.reply(deliver_envelope(&message, None)?);
        }
        Ok(count)
    }

    /// Unregister and close out the session record.
    pub async fn release(&self, session: &Session, closed_by: ClosedBy) {
        self.state.unregister(&session.agent, session.conn_id).await;
        if let Err(e) = self
            .state
            .store
            .end_session(&session.session_id, now_ms(), closed_by)
            .await
        {
            tracing::warn!(agent = %session.agent, error = %e, "Failed to end session");
        }
        self.touch_summary(session, None).await;
        tracing::info!(
            agent = %session.agent,
            session_id = %session.session_id,
            closed_by = closed_by.as_str(),
            "Agent disconnected"
        );
    }

    async fn touch_summary(&self, session: &Session, last_message_id: Option<&str>) {
        let store = &self.state.store;
        let mut summary = match store.get_agent_summary(&session.agent).await {
            Ok(Some(summary)) => summary,
            Ok(None) => AgentSummary::new(session.agent.clone()),
            Err(e) => {
                tracing::debug!(agent = %session.agent, error = %e, "Agent summary unreadable");
                AgentSummary::new(session.agent.clone())
            }
        };
        summary.last_seen = chrono::Utc::now();
        if session.project.is_some() {
            summary.project_id = session.project.clone();
        }
        if let Some(id) = last_message_id {
            summary.last_message_id = Some(id.to_string());
        }
        if let Err(e) = store.upsert_agent_summary(&summary).await {
            tracing::warn!(agent = %session.agent, error = %e, "Failed to update agent summary");
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Apply one envelope from a handshaken agent.
    pub async fn handle(&self, session: &Session, envelope: Envelope) -> RouterResult<Flow> {
        match envelope.kind {
            MessageType::Send => self.route_send(session, envelope).await?,
            MessageType::ChannelMessage => self.route_channel_message(session, envelope).await?,
            MessageType::ProposalCreate | MessageType::Vote => {
                self.forward_live(session, envelope).await?
            }
            MessageType::Ack => self.handle_ack(session, envelope).await?,
            MessageType::Nack => self.handle_nack(session, envelope).await?,
            MessageType::Busy => self.forward_busy(session, envelope).await?,
            MessageType::Ping => session.reply(correlated(
                Envelope::new(MessageType::Pong, serde_json::Value::Null),
                &envelope.id,
            )),
            MessageType::Pong => {}
            MessageType::Sync => self.handle_sync(session, envelope).await?,
            MessageType::ChannelJoin => self.handle_channel(session, envelope, true).await?,
            MessageType::ChannelLeave => self.handle_channel(session, envelope, false).await?,
            MessageType::ShadowBind => self.handle_shadow_bind(session, envelope).await?,
            MessageType::ShadowUnbind => {
                if self.state.unbind_shadow(&session.agent).await {
                    tracing::info!(shadow = %session.agent, "Shadow unbound");
                }
            }
            MessageType::Spawn | MessageType::Release => {
                self.handle_lifecycle(session, envelope).await?
            }
            MessageType::Log => {
                let log: LogPayload = envelope.payload_as()?;
                tracing::info!(target: "agent_log", agent = %session.agent, "{}", log.data);
            }
            MessageType::Bye => return Ok(Flow::Close(ClosedBy::Agent)),
            MessageType::Error => {
                tracing::warn!(agent = %session.agent, payload = %envelope.payload, "Agent reported error");
            }
            MessageType::Hello => {
                return Err(RouterError::handshake(
                    "ALREADY_CONNECTED",
                    "HELLO after handshake",
                ))
            }
            MessageType::Welcome
            | MessageType::Deliver
            | MessageType::SpawnResult
            | MessageType::ReleaseResult => {
                return Err(ProtocolError::MalformedEnvelope(format!(
                    "{} is not accepted from agents",
                    envelope.kind
                ))
                .into())
            }
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // SEND
    // -----------------------------------------------------------------------

    async fn recipients(&self, session: &Session, target: &Target) -> RouterResult<Vec<String>> {
        Ok(match target {
            Target::Agent(name) => vec![name.clone()],
            Target::Broadcast => self
                .state
                .live_agents()
                .await
                .into_iter()
                .filter(|a| *a != session.agent)
                .collect(),
            Target::Channel(channel) => self
                .state
                .channels
                .members(&channel_key(channel))
                .await?
                .into_iter()
                .filter(|m| *m != session.agent)
                .collect(),
            Target::Project { .. } => Vec::new(),
        })
    }

    async fn route_send(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        if let Err(retry_after_ms) = self.state.check_rate(&session.agent).await {
            tracing::debug!(agent = %session.agent, retry_after_ms, "SEND rate limited");
            let busy = BusyPayload {
                retry_after_ms,
                queue_depth: 0,
            };
            session.reply(correlated(
                Envelope::with_payload(MessageType::Busy, &busy)?,
                &envelope.id,
            ));
            return Ok(());
        }

        let to = envelope
            .to
            .clone()
            .ok_or_else(|| ProtocolError::InvalidTarget("missing 'to'".into()))?;
        let target = Target::parse(&to)?;
        let payload: SendPayload = envelope.payload_as()?;

        if let Target::Project { project, agent } = &target {
            return self.forward_to_project(session, project, agent, envelope).await;
        }

        if let Err(e) = self
            .state
            .store
            .increment_session_messages(&session.session_id)
            .await
        {
            tracing::warn!(agent = %session.agent, error = %e, "Failed to count session message");
        }
        self.touch_summary(session, Some(&envelope.id)).await;

        let recipients = self.recipients(session, &target).await?;
        let fan_out = !matches!(target, Target::Agent(_));
        if recipients.is_empty() {
            tracing::debug!(from = %session.agent, to = %to, "No recipients");
        }

        for recipient in recipients {
            let stored = StoredMessage {
                id: if fan_out {
                    format!("{}{PROJECT_SEPARATOR}{recipient}", envelope.id)
                } else {
                    envelope.id.clone()
                },
                ts: envelope.ts,
                from: session.agent.clone(),
                to: recipient.clone(),
                topic: envelope.topic.clone(),
                kind: payload.kind.as_str().to_string(),
                body: payload.body.clone(),
                data: payload.data.clone(),
                thread: payload.thread.clone(),
                delivery_seq: None,
                delivery_session_id: None,
                session_id: Some(session.session_id.clone()),
                status: MessageStatus::Unread,
                is_urgent: envelope.is_urgent(),
                is_broadcast: matches!(target, Target::Broadcast),
            };
            self.state
                .track_pending(
                    &envelope.id,
                    &recipient,
                    PendingDelivery {
                        stored_id: stored.id.clone(),
                        sender: session.agent.clone(),
                        correlation_id: envelope.correlation_id().map(str::to_string),
                    },
                )
                .await;
            self.deliver(stored, envelope.payload_meta.clone()).await?;
        }

        let copies = self.state.shadows_of(&session.agent, false).await;
        if !copies.is_empty() {
            let mut copy = envelope;
            copy.kind = MessageType::Deliver;
            copy.from = Some(session.agent.clone());
            for shadow in copies {
                let _ = shadow.outbound.send(copy.clone());
            }
        }
        Ok(())
    }

    /// Persist `message` and push it to the recipient if connected. Returns
    /// whether it went out live.
    async fn deliver(&self, mut message: StoredMessage, meta: Option<PayloadMeta>) -> RouterResult<bool> {
        let gate = self.state.gate(&message.to).await;
        let _delivery = gate.lock().await;

        let Some(handle) = self.state.connection(&message.to).await else {
            self.state.store.save_message(&message).await?;
            tracing::debug!(to = %message.to, id = %message.id, "Recipient offline, stored for replay");
            return Ok(false);
        };

        let seq = self
            .state
            .next_seq(&message.to, message.topic_or_default(), &message.from)
            .await?;
        message.delivery_seq = Some(seq);
        message.delivery_session_id = Some(handle.session_id.clone());
        self.state.store.save_message(&message).await?;

        let envelope = deliver_envelope(&message, meta)?;
        if handle.outbound.send(envelope.clone()).is_err() {
            tracing::debug!(to = %message.to, "Recipient closed during delivery");
            return Ok(false);
        }
        for shadow in self.state.shadows_of(&message.to, true).await {
            if shadow.agent != message.from {
                let _ = shadow.outbound.send(envelope.clone());
            }
        }
        Ok(true)
    }

    async fn route_channel_message(&self, session: &Session, mut envelope: Envelope) -> RouterResult<()> {
        let to = envelope
            .to
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidTarget("CHANNEL_MESSAGE without channel".into()))?;
        let channel = channel_key(to);
        envelope.to = Some(channel);
        self.route_send(session, envelope).await
    }

    async fn forward_to_project(
        &self,
        session: &Session,
        project: &str,
        agent: &str,
        mut envelope: Envelope,
    ) -> RouterResult<()> {
        let bridge = self
            .state
            .bridge(project)
            .ok_or_else(|| RouterError::UnknownProject(project.to_string()))?;
        envelope.from = Some(session.agent.clone());
        bridge.forward(agent, &envelope).await?;
        tracing::debug!(from = %session.agent, project, agent, "Forwarded to project bridge");
        Ok(())
    }

    /// PROPOSAL_CREATE and VOTE: same addressing as SEND, delivered to
    /// connected recipients only, no persistence or ACK tracking.
    async fn forward_live(&self, session: &Session, mut envelope: Envelope) -> RouterResult<()> {
        let to = envelope
            .to
            .clone()
            .ok_or_else(|| ProtocolError::InvalidTarget("missing 'to'".into()))?;
        let target = Target::parse(&to)?;
        if let Target::Project { project, agent } = &target {
            return self.forward_to_project(session, project, agent, envelope).await;
        }
        envelope.from = Some(session.agent.clone());
        for recipient in self.recipients(session, &target).await? {
            match self.state.connection(&recipient).await {
                Some(handle) => {
                    let _ = handle.outbound.send(envelope.clone());
                }
                None => tracing::debug!(
                    kind = %envelope.kind,
                    to = %recipient,
                    "Recipient not connected, dropped"
                ),
            }
        }
        Ok(())
    }

    async fn forward_busy(&self, session: &Session, mut envelope: Envelope) -> RouterResult<()> {
        let to = envelope
            .to
            .clone()
            .ok_or_else(|| ProtocolError::InvalidTarget("BUSY without 'to'".into()))?;
        envelope.from = Some(session.agent.clone());
        match self.state.connection(&to).await {
            Some(handle) => {
                let _ = handle.outbound.send(envelope);
            }
            None => tracing::debug!(from = %session.agent, to = %to, "BUSY target not connected"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ACK / NACK
    // -----------------------------------------------------------------------

    /// Stored record for a delivery the daemon no longer tracks in memory.
    async fn lookup_delivered(&self, envelope_id: &str, agent: &str) -> RouterResult<Option<StoredMessage>> {
        let store = &self.state.store;
        if let Some(message) = store.get_message_by_id(envelope_id).await? {
            if message.to == agent {
                return Ok(Some(message));
            }
        }
        let fan_out_id = format!("{envelope_id}{PROJECT_SEPARATOR}{agent}");
        Ok(store.get_message_by_id(&fan_out_id).await?)
    }

    /// Resolve an ACK/NACK to (stored id, original sender, correlation id).
    async fn resolve_ack(
        &self,
        ack_id: &str,
        agent: &str,
    ) -> RouterResult<Option<(String, String, Option<String>)>> {
        if let Some(pending) = self.state.take_pending(ack_id, agent).await {
            return Ok(Some((pending.stored_id, pending.sender, pending.correlation_id)));
        }
        Ok(self
            .lookup_delivered(ack_id, agent)
            .await?
            .map(|m| (m.id, m.from, None)))
    }

    async fn handle_ack(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        let ack: AckPayload = envelope.payload_as()?;
        let Some((stored_id, sender, correlation)) = self.resolve_ack(&ack.ack_id, &session.agent).await?
        else {
            tracing::debug!(agent = %session.agent, ack_id = %ack.ack_id, "Unmatched ACK discarded");
            return Ok(());
        };
        self.state
            .store
            .update_message_status(&stored_id, MessageStatus::Acked)
            .await?;

        let Some(correlation_id) = correlation.or_else(|| ack.correlation_id.clone()) else {
            return Ok(());
        };
        let forwarded = AckPayload {
            correlation_id: Some(correlation_id.clone()),
            ..ack
        };
        let reply = correlated(
            Envelope::with_payload(MessageType::Ack, &forwarded)?
                .from(session.agent.clone())
                .to(sender.clone()),
            &correlation_id,
        );
        self.send_live(&sender, reply).await;
        Ok(())
    }

    async fn handle_nack(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        let nack: NackPayload = envelope.payload_as()?;
        let Some((stored_id, sender, correlation)) = self.resolve_ack(&nack.ack_id, &session.agent).await?
        else {
            tracing::debug!(agent = %session.agent, ack_id = %nack.ack_id, "Unmatched NACK discarded");
            return Ok(());
        };
        self.state
            .store
            .update_message_status(&stored_id, MessageStatus::Failed)
            .await?;
        tracing::debug!(agent = %session.agent, ack_id = %nack.ack_id, code = %nack.code, "Delivery rejected");

        let mut reply = Envelope::with_payload(MessageType::Nack, &nack)?
            .from(session.agent.clone())
            .to(sender.clone());
        if let Some(correlation_id) = correlation.as_deref().or(envelope.correlation_id()) {
            reply = correlated(reply, correlation_id);
        }
        self.send_live(&sender, reply).await;
        Ok(())
    }

    async fn send_live(&self, agent: &str, envelope: Envelope) {
        match self.state.connection(agent).await {
            Some(handle) => {
                let _ = handle.outbound.send(envelope);
            }
            None => tracing::debug!(to = %agent, kind = %envelope.kind, "Reply target not connected"),
        }
    }

    // -----------------------------------------------------------------------
    // SYNC
    // -----------------------------------------------------------------------

    /// Replay every stored message with a sequence above the agent's
    /// `last_seq` for each requested stream, then answer with the server's
    /// view of all streams. Holds the agent's delivery gate throughout so no
    /// live DELIVER interleaves with the replay.
    async fn handle_sync(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        let request: SyncPayload = envelope.payload_as()?;
        let store = &self.state.store;

        let gate = self.state.gate(&session.agent).await;
        let _delivery = gate.lock().await;

        let server = store.get_max_seq_by_stream(&session.agent, None).await?;
        let mut replayed = 0u64;
        let mut streams = Vec::with_capacity(server.len().max(request.streams.len()));

        for wanted in &request.streams {
            let server_last = server
                .iter()
                .find(|s| s.topic == wanted.topic && s.peer == wanted.peer)
                .map(|s| s.max_seq)
                .unwrap_or(0);
            if server_last > wanted.last_seq {
                let query = MessageQuery {
                    from: Some(wanted.peer.clone()),
                    to: Some(session.agent.clone()),
                    topic: Some(wanted.topic.clone()),
                    ..Default::default()
                };
                let mut missed: Vec<StoredMessage> = store
                    .get_messages(&query)
                    .await?
                    .into_iter()
                    .filter(|m| m.delivery_seq.is_some_and(|seq| seq > wanted.last_seq))
                    .collect();
                missed.sort_by_key(|m| (m.delivery_seq, m.ts));
                for message in &missed {
                    session.reply(deliver_envelope(message, None)?);
                }
                replayed += missed.len() as u64;
            }
            streams.push(SyncStream {
                topic: wanted.topic.clone(),
                peer: wanted.peer.clone(),
                last_seq: wanted.last_seq,
                server_last_seq: Some(server_last),
            });
        }
        for known in server {
            let requested = request
                .streams
                .iter()
                .any(|s| s.topic == known.topic && s.peer == known.peer);
            if !requested {
                streams.push(SyncStream {
                    topic: known.topic,
                    peer: known.peer,
                    last_seq: 0,
                    server_last_seq: Some(known.max_seq),
                });
            }
        }

        if replayed > 0 {
            tracing::info!(agent = %session.agent, replayed, "SYNC replay complete");
        }
        let response = SyncPayload {
            session_id: Some(session.session_id.clone()),
            streams,
            replayed: Some(replayed),
        };
        session.reply(correlated(
            Envelope::with_payload(MessageType::Sync, &response)?,
            &envelope.id,
        ));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Channels, shadows, lifecycle
    // -----------------------------------------------------------------------

    async fn handle_channel(&self, session: &Session, envelope: Envelope, join: bool) -> RouterResult<()> {
        let payload: ChannelPayload = envelope.payload_as()?;
        let channel = channel_key(&payload.channel);
        let member = payload.member.unwrap_or_else(|| session.agent.clone());
        if join {
            self.state.channels.add_member(&channel, &member).await?;
            tracing::info!(channel = %channel, member = %member, "Joined channel");
        } else {
            self.state.channels.remove_member(&channel, &member).await?;
            tracing::info!(channel = %channel, member = %member, "Left channel");
        }
        Ok(())
    }

    async fn handle_shadow_bind(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        let bind: ShadowBindPayload = envelope.payload_as()?;
        if bind.primary_agent == session.agent {
            return Err(ProtocolError::InvalidTarget("an agent cannot shadow itself".into()).into());
        }
        self.state.bind_shadow(&session.agent, &bind).await;
        tracing::info!(shadow = %session.agent, primary = %bind.primary_agent, "Shadow bound");
        Ok(())
    }

    async fn handle_lifecycle(&self, session: &Session, envelope: Envelope) -> RouterResult<()> {
        let spawner = self.state.spawner();
        let (kind, result): (MessageType, LifecycleResultPayload) = match envelope.kind {
            MessageType::Spawn => {
                let request: SpawnPayload = envelope.payload_as()?;
                tracing::info!(requested_by = %session.agent, name = %request.name, cli = %request.cli, "Spawn requested");
                let result = match spawner {
                    Some(s) => s.spawn(&request).await,
                    None => spawner::unsupported(&request.name),
                };
                (MessageType::SpawnResult, result)
            }
            _ => {
                let request: ReleasePayload = envelope.payload_as()?;
                tracing::info!(requested_by = %session.agent, name = %request.name, "Release requested");
                let result = match spawner {
                    Some(s) => s.release(&request).await,
                    None => spawner::unsupported(&request.name),
                };
                (MessageType::ReleaseResult, result)
            }
        };
        session.reply(correlated(Envelope::with_payload(kind, &result)?, &envelope.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, to: &str) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            ts: 10,
            from: "alice".into(),
            to: to.into(),
            topic: None,
            kind: "action".into(),
            body: "run tests".into(),
            data: None,
            thread: None,
            delivery_seq: Some(3),
            delivery_session_id: Some("s1".into()),
            session_id: None,
            status: MessageStatus::Unread,
            is_urgent: true,
            is_broadcast: false,
        }
    }

    #[test]
    fn test_fan_out_id_maps_back_to_envelope() {
        assert_eq!(envelope_id_of(&stored("e1:bob", "bob")), "e1");
        assert_eq!(envelope_id_of(&stored("e1", "bob")), "e1");
    }

    #[test]
    fn test_deliver_envelope_shape() {
        let env = deliver_envelope(&stored("e1:bob", "bob"), None).unwrap();
        assert_eq!(env.kind, MessageType::Deliver);
        assert_eq!(env.id, "e1");
        assert_eq!(env.from.as_deref(), Some("alice"));
        assert_eq!(env.delivery, Some(DeliveryInfo { seq: 3, session_id: "s1".into() }));
        assert!(env.is_urgent());
        let payload: SendPayload = env.payload_as().unwrap();
        assert_eq!(payload.kind, PayloadKind::Action);
        assert_eq!(payload.body, "run tests");
    }

    #[test]
    fn test_channel_key_normalizes() {
        assert_eq!(channel_key("general"), "#general");
        assert_eq!(channel_key("#general"), "#general");
    }

    #[test]
    fn test_agent_name_rules() {
        assert!(valid_agent_name("Worker1"));
        assert!(!valid_agent_name("*"));
        assert!(!valid_agent_name("#ops"));
        assert!(!valid_agent_name("backend:bob"));
        assert!(!valid_agent_name("two words"));
    }
}
