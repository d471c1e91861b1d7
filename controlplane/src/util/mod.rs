pub mod config;
#[cfg(test)]
pub(crate) mod mock_client;
pub mod once;
pub mod stopper;

use kecs_shared::ecs::error::EcsError;
use kecs_shared::ecs::retry::{backoff_for_attempt, MAX_TRANSIENT_TRIES};
use std::future::Future;

/// Run a Kubernetes call, retrying transient failures with the standard
/// backoff before surfacing a dependency failure. Non-transient errors
/// surface immediately.
pub async fn with_transient_retry<T, F, Fut>(operation_name: &str, mut call: F) -> Result<T, EcsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let classified = EcsError::from(e);
                if !classified.is_retryable() || attempt + 1 >= MAX_TRANSIENT_TRIES {
                    if classified.is_retryable() {
                        log::error!(
                            "with_transient_retry - {} exhausted {} attempts: {}",
                            operation_name,
                            MAX_TRANSIENT_TRIES,
                            classified
                        );
                        return Err(EcsError::DependencyFailure(classified.to_string()));
                    }
                    return Err(classified);
                }
                log::trace!(
                    "with_transient_retry - {} attempt {} failed transiently: {}",
                    operation_name,
                    attempt,
                    classified
                );
                tokio::time::sleep(backoff_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}
