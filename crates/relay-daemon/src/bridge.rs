//! Cross-project forwarding for `project:agent` targets.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use relay_protocol::{Envelope, SendPayload};

use crate::client::{ClientOptions, RelayClient};
use crate::config::RelayAddr;
use crate::{RouterError, RouterResult};

/// Carries a local SEND to an agent managed by another daemon.
#[async_trait]
pub trait ProjectBridge: Send + Sync {
    async fn forward(&self, agent: &str, envelope: &Envelope) -> RouterResult<()>;
}

/// Bridge that connects to the remote daemon as an ordinary agent and
/// re-sends the message there. The original sender is kept in
/// `payload_meta.reply_to`.
pub struct SocketBridge {
    project: String,
    addr: RelayAddr,
    name: String,
    client: Mutex<Option<Arc<RelayClient>>>,
}

impl SocketBridge {
    pub fn new(project: impl Into<String>, addr: RelayAddr, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            addr,
            name: name.into(),
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> RouterResult<Arc<RelayClient>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref().filter(|c| c.is_connected()) {
            return Ok(Arc::clone(client));
        }
        let client = RelayClient::connect(&self.addr, ClientOptions::new(self.name.clone()))
            .await
            .map_err(|e| RouterError::Bridge {
                project: self.project.clone(),
                message: e.to_string(),
            })?;
        tracing::info!(project = %self.project, addr = %self.addr, "Project bridge connected");
        let client = Arc::new(client);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl ProjectBridge for SocketBridge {
    async fn forward(&self, agent: &str, envelope: &Envelope) -> RouterResult<()> {
        let payload: SendPayload = envelope.payload_as()?;
        let mut outgoing = Envelope::send(agent, &payload)?;
        outgoing.id = envelope.id.clone();
        outgoing.topic = envelope.topic.clone();
        let mut meta = envelope.payload_meta.clone().unwrap_or_default();
        if meta.reply_to.is_none() {
            meta.reply_to = envelope.from.clone();
        }
        outgoing.payload_meta = Some(meta);

        let client = self.client().await?;
        if client.send_envelope(outgoing.clone()).is_ok() {
            return Ok(());
        }
        // Connection went away since the last check; redial once.
        self.client.lock().await.take();
        self.client()
            .await?
            .send_envelope(outgoing)
            .map_err(|e| RouterError::Bridge {
                project: self.project.clone(),
                message: e.to_string(),
            })
    }
}
