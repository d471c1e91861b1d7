//! Cancellation latch shared by every long-running loop.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable one-way latch. Watchers, the batch updater and the sync
/// controller poll it with `tokio::select!` and drain cleanly when it
/// fires.
#[derive(Clone)]
pub struct Stopper {
    state: Arc<watch::Sender<bool>>,
}

impl Stopper {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Flip the latch once SIGTERM arrives. Spawned separately from
    /// `new` so tests never install signal handlers.
    pub fn stop_on_sigterm(&self) {
        let stopper = self.clone();
        tokio::spawn(async move {
            let mut signal = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    log::error!("stop_on_sigterm - could not install handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = stopper.stopped() => {}
                _ = signal.recv() => stopper.stop(),
            }
        });
    }

    pub fn stop(&self) {
        self.state.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once `stop` has been called; resolves immediately if it
    /// already was.
    pub async fn stopped(&self) {
        let mut receiver = self.state.subscribe();
        if !*receiver.borrow_and_update() {
            let _ = receiver.changed().await;
        }
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopper_latches() {
        let stopper = Stopper::new();
        assert!(!stopper.is_stopped());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stopper.stopped())
                .await
                .is_err()
        );
        stopper.stop();
        assert!(stopper.is_stopped());
        // resolves immediately once latched
        tokio::time::timeout(Duration::from_millis(50), stopper.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_the_latch() {
        let stopper = Stopper::new();
        let clone = stopper.clone();
        stopper.stop();
        assert!(clone.is_stopped());
    }
}
