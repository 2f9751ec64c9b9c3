//! Listener: accepts unix-socket or TCP connections and serves each on its
//! own task, bounded by `max_connections`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;

use crate::config::RelayAddr;
use crate::connection::serve_connection;
use crate::router::Router;
use crate::state::DaemonState;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct RelayServer {
    router: Router,
    addr: RelayAddr,
    max_connections: usize,
}

impl RelayServer {
    /// Listen on the address configured in `[daemon]`.
    pub fn new(state: Arc<DaemonState>) -> Result<Self, crate::RouterError> {
        let addr = state.config.listen_addr()?;
        Ok(Self::with_addr(state, addr))
    }

    pub fn with_addr(state: Arc<DaemonState>, addr: RelayAddr) -> Self {
        let max_connections = state.config.max_connections.max(1);
        Self {
            router: Router::new(state),
            addr,
            max_connections,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Accept connections until the task is dropped. Failed accepts are
    /// logged and retried; only binding can fail.
    pub async fn run(self) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        match &self.addr {
            RelayAddr::Unix(path) => {
                let listener = &bind_unix(path)?;
                tracing::info!(addr = %self.addr, max_connections = self.max_connections, "Relay listening");
                loop {
                    let (stream, _) = accept_next(|| listener.accept()).await;
                    let permit = semaphore.clone().acquire_owned().await?;
                    spawn_connection(stream, self.router.clone(), "unix".to_string(), permit);
                }
            }
            RelayAddr::Tcp(addr) => {
                let listener = &TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding {addr}"))?;
                tracing::info!(addr = %self.addr, max_connections = self.max_connections, "Relay listening");
                loop {
                    let (stream, peer_addr) = accept_next(|| listener.accept()).await;
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let permit = semaphore.clone().acquire_owned().await?;
                    spawn_connection(stream, self.router.clone(), peer_addr.to_string(), permit);
                }
            }
        }
    }
}

async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn bind_unix(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    if path.exists() {
        tracing::debug!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

fn spawn_connection<S>(
    stream: S,
    router: Router,
    peer: String,
    permit: tokio::sync::OwnedSemaphorePermit,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tracing::debug!(peer = %peer, "Client connected");
    tokio::spawn(async move {
        if let Err(e) = serve_connection(stream, router, peer.clone()).await {
            tracing::warn!(peer = %peer, error = %e, "Connection error");
        }
        drop(permit);
    });
}
