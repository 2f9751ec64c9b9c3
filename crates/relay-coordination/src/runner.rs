//! Start/stop plumbing shared by the periodic components.

use std::future::Future;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::{CoordinationError, CoordinationResult};

pub(crate) struct Runner {
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the component loop. The loop must exit once the receiver
    /// observes a change.
    pub async fn launch<F, Fut>(&self, name: &'static str, run: F) -> CoordinationResult<()>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CoordinationError::AlreadyRunning(name));
        }
        self.shutdown.send_replace(false);
        *handle = Some(tokio::spawn(run(self.shutdown.subscribe())));
        Ok(())
    }

    /// Signal the loop and wait for it. Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(handle) = self.handle.lock().await.take() else {
            return false;
        };
        self.shutdown.send_replace(true);
        let _ = handle.await;
        true
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
