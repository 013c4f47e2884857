//! Retry with exponential backoff and jitter.
//!
//! One policy for every upstream call site (embedding, LLM, vector store,
//! external agent directory). Boundary validation errors are never retried.

use crate::errors::{AppError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for the exponential delay
    pub max_delay: Duration,
    /// Add up to this fraction of the delay as random jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay for a given retry (0-based).
    fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return exp;
        }
        let jitter_ms = (exp.as_millis() as f64 * self.jitter) as u64;
        let extra = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        exp + Duration::from_millis(extra)
    }
}

/// Run `op` under the policy, retrying transient errors only.
///
/// `label` names the operation in logs and in the exhaustion error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<AppError> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient failure, retrying"
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| AppError::Internal {
        message: format!("{label}: retries exhausted"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let result = with_retry(&policy, "noop", || async { Ok::<_, AppError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::new(3)
        };
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Embedding {
                        message: "transient".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_validation_errors() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::new(3)
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, "invalid", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::validation("bad input", Some("question"))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::new(2)
        };

        let result: Result<()> = with_retry(&policy, "dead", || async {
            Err(AppError::VectorStore {
                message: "unreachable".into(),
            })
        })
        .await;

        match result {
            Err(AppError::VectorStore { .. }) => {}
            other => panic!("expected VectorStore error, got {other:?}"),
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }
}
