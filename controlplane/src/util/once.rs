//! Process-wide once-latch for cluster add-ons.
//!
//! Initialization that must happen at most once per process (such as
//! creating the control-plane namespace) runs through a latch that
//! remembers the first outcome. Tests reset the latch explicitly
//! instead of observing leftover state from earlier tests.

use std::future::Future;
use tokio::sync::Mutex;

/// A typed once-latch holding the result of its initializer.
pub struct OnceLatch {
    state: Mutex<Option<Result<(), String>>>,
}

impl OnceLatch {
    pub const fn new() -> Self {
        OnceLatch {
            state: Mutex::const_new(None),
        }
    }

    /// Run `init` the first time; replay its recorded outcome on every
    /// later call.
    pub async fn ensure<F, Fut>(&self, init: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let mut state = self.state.lock().await;
        if let Some(outcome) = state.as_ref() {
            return outcome.clone();
        }
        let outcome = init().await;
        *state = Some(outcome.clone());
        outcome
    }

    /// Forget the recorded outcome so the next `ensure` runs again.
    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }
}
