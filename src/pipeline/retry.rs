//! Timeout and bounded retry around upstream model calls.

use super::state::QueryStage;
use crate::embedding::EmbeddingError;
use crate::error::RagError;
use crate::generation::GenerationError;
use crate::rerank::RerankError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upstream errors that know whether a retry may help.
pub(crate) trait UpstreamError: std::fmt::Display + Into<RagError> {
    fn is_transient(&self) -> bool;
}

impl UpstreamError for EmbeddingError {
    fn is_transient(&self) -> bool {
        EmbeddingError::is_transient(self)
    }
}

impl UpstreamError for GenerationError {
    fn is_transient(&self) -> bool {
        GenerationError::is_transient(self)
    }
}

impl UpstreamError for RerankError {
    fn is_transient(&self) -> bool {
        matches!(self, RerankError::Unavailable(_))
    }
}

/// Bounds applied to every upstream call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Run `operation` with a per-attempt timeout, retrying transient failures with a doubling
/// backoff. Cancelling `cancel` abandons the in-flight attempt and returns `Cancelled`.
pub(crate) async fn with_retry<F, Fut, T, E>(
    policy: RetryPolicy,
    stage: QueryStage,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RagError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: UpstreamError,
{
    let mut attempt = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            outcome = tokio::time::timeout(policy.timeout, operation()) => outcome,
        };

        let last_attempt = attempt >= policy.max_retries;
        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) if error.is_transient() && !last_attempt => {
                tracing::warn!(
                    %stage,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    error = %error,
                    "Retrying after transient upstream error"
                );
            }
            Ok(Err(error)) => return Err(error.into()),
            Err(_) if !last_attempt => {
                tracing::warn!(
                    %stage,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    timeout_ms = policy.timeout.as_millis() as u64,
                    "Retrying after upstream timeout"
                );
            }
            Err(_) => {
                return Err(RagError::UpstreamTimeout {
                    stage,
                    timeout: policy.timeout,
                });
            }
        }

        let backoff = INITIAL_BACKOFF * 2_u32.saturating_pow(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            policy(1),
            QueryStage::Embedding,
            &CancellationToken::new(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EmbeddingError::Unavailable("down".into()))
                } else {
                    Ok(vec![1.0_f32])
                }
            },
        )
        .await
        .expect("second attempt succeeds");
        assert_eq!(result, vec![1.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let error = with_retry(
            policy(3),
            QueryStage::Embedding,
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Vec<f32>, _>(EmbeddingError::InvalidInput("empty".into()))
            },
        )
        .await
        .expect_err("permanent");
        assert!(matches!(error, RagError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_timeouts_surface_as_upstream_timeout() {
        let calls = AtomicU32::new(0);
        let error = with_retry(
            policy(1),
            QueryStage::Generating,
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, GenerationError>(String::new())
            },
        )
        .await
        .expect_err("timeout");
        assert!(matches!(
            error,
            RagError::UpstreamTimeout {
                stage: QueryStage::Generating,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_in_flight_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let error = with_retry(
            RetryPolicy {
                timeout: Duration::from_secs(5),
                max_retries: 0,
            },
            QueryStage::Generating,
            &cancel,
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, GenerationError>(String::new())
            },
        )
        .await
        .expect_err("cancelled");
        assert!(matches!(error, RagError::Cancelled));
    }
}
