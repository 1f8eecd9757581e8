use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff: `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with an error `is_transient`
    /// rejects, or the attempt budget runs out.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && is_transient(&error) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        ?delay,
                        %error,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(RetryFailure { error, attempts: attempt }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast(5)
            .run(
                "test",
                || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("busy".to_string())
                    } else {
                        Ok(7)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast(5)
            .run(
                "test",
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("denied".to_string())
                },
                |_| false,
            )
            .await;

        let failure = result.expect_err("permanent error");
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let result: Result<(), _> = fast(3)
            .run("test", || async { Err("busy".to_string()) }, |_| true)
            .await;
        assert_eq!(result.expect_err("exhausted").attempts, 3);
    }
}
