use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// A cloneable handle used to begin and observe engine shutdown.
///
/// The engine never installs signal handlers itself — the host process owns
/// those and calls [`Shutdown::shutdown`] (or [`crate::Engine::stop`]).
#[derive(Clone, Debug)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);

        Self {
            sender: Arc::new(sender),
        }
    }

    /// Send the signal to shutdown the engine.
    pub fn shutdown(&self) {
        info!("Initiating shutdown");
        // Does not fail because we hold a sender, so the channel never closes.
        self.sender.send(true).ok();
    }

    /// Are we currently shutting down?
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for the shutdown to begin.
    ///
    /// Resolves immediately if the engine is already shutting down.
    /// The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.sender.subscribe();
        if *watch.borrow_and_update() {
            return;
        }
        watch.changed().await.ok();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let start = tokio::time::Instant::now();
        let shutdown = Shutdown::new();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();

        assert!(elapsed > Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn await_resolves_immediately_when_already_down() {
        eprintln!("DEBUG A");
        let shutdown = Shutdown::new();
        eprintln!("DEBUG B");
        shutdown.shutdown();
        eprintln!("DEBUG C");
        shutdown.await_shutdown_begin().await;
        eprintln!("DEBUG D");
    }
}
