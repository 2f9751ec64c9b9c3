//! Seams between the coordination components and the messaging layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CoordinationError, CoordinationResult};

/// Outbound message produced by a coordination component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Anything that can put a SEND on the wire.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(
        &self,
        to: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) -> CoordinationResult<()>;
}

/// Queue-backed sink; the receiving half decides how messages leave.
#[async_trait]
impl MessageSink for mpsc::UnboundedSender<OutboundMessage> {
    async fn send_message(
        &self,
        to: &str,
        body: &str,
        data: Option<serde_json::Value>,
    ) -> CoordinationResult<()> {
        self.send(OutboundMessage {
            to: to.to_string(),
            body: body.to_string(),
            data,
        })
        .map_err(|_| CoordinationError::Transport("outbound queue closed".into()))
    }
}

/// Supplies the workers a coordinator may lease tasks to.
#[async_trait]
pub trait WorkerSource: Send + Sync {
    async fn available_workers(&self) -> Vec<String>;
}

/// A fixed worker pool.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkers(pub Vec<String>);

#[async_trait]
impl WorkerSource for StaticWorkers {
    async fn available_workers(&self) -> Vec<String> {
        self.0.clone()
    }
}
