// ABOUTME: Retry with exponential backoff, driven by the engine error's failure class
// ABOUTME: Transient errors retry up to the limit, internal errors once, terminal errors never

use crate::executors::{EngineError, FailureClass};
use crate::settings::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A single attempt, as used for the light engine
    pub fn once_more(&self) -> Self {
        Self {
            max_retries: self.max_retries.min(1),
            ..self.clone()
        }
    }

    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn allows_retry(&self, class: FailureClass, retries_so_far: u32) -> bool {
        match class {
            FailureClass::Transient => retries_so_far < self.max_retries,
            FailureClass::Internal => retries_so_far < self.max_retries.min(1),
            FailureClass::Terminal => false,
        }
    }
}

/// Run `operation` until it succeeds or the policy gives up; returns the last error
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if policy.allows_retry(err.class(), attempt) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
        }
    }

    #[rstest]
    #[case(0, 200)]
    #[case(1, 400)]
    #[case(2, 800)]
    #[case(5, 5000)]
    #[case(40, 5000)]
    fn test_delay_doubles_and_caps(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(policy().delay_for(attempt), Duration::from_millis(millis));
    }

    #[rstest]
    #[case::transient(EngineError::Busy("queue".into()), 3)]
    #[case::internal(EngineError::Internal("adapter".into()), 2)]
    #[case::terminal(EngineError::InvalidJob("path".into()), 1)]
    #[tokio::test(start_paused = true)]
    async fn test_attempts_per_failure_class(#[case] error: EngineError, #[case] expected: u32) {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            async move { Err(error) }
        })
        .await;

        assert_eq!(result, Err(error));
        assert_eq!(calls.load(Ordering::SeqCst), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_a_later_attempt() {
        let started = tokio::time::Instant::now();
        let result = retry_with_backoff(&policy(), "test", |attempt| async move {
            if attempt < 2 {
                Err(EngineError::Unavailable("docker restarting".into()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[test]
    fn test_once_more_caps_retries() {
        assert_eq!(policy().once_more().max_retries, 1);
        let none = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert_eq!(none.once_more().max_retries, 0);
    }
}
