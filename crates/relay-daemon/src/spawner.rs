//! Agent lifecycle seam. Process spawning lives outside the daemon; the
//! router only hands SPAWN and RELEASE requests to whatever implements
//! [`Spawner`].

use async_trait::async_trait;

use relay_protocol::{LifecycleResultPayload, ReleasePayload, SpawnPayload};

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, request: &SpawnPayload) -> LifecycleResultPayload;

    async fn release(&self, request: &ReleasePayload) -> LifecycleResultPayload;
}

/// Result sent when no spawner is configured.
pub fn unsupported(name: &str) -> LifecycleResultPayload {
    LifecycleResultPayload {
        name: name.to_string(),
        success: false,
        pid: None,
        error: Some("no spawner configured on this daemon".into()),
    }
}
