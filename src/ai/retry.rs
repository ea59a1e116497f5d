use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `f` until it succeeds, the attempts run out, or `should_retry`
    /// rejects the error.
    pub async fn execute<F, Fut, T, E>(
        &self,
        mut f: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(self.config.initial_delay_ms);

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Retry succeeded on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if !should_retry(&error) => return Err(error),
                Err(error) if attempt >= self.config.max_attempts => {
                    warn!("All {} retry attempts exhausted", self.config.max_attempts);
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    sleep(delay).await;
                    delay = self.calculate_next_delay(delay);
                }
            }
        }
    }

    fn calculate_next_delay(&self, current_delay: Duration) -> Duration {
        let mut next_delay =
            Duration::from_secs_f64(current_delay.as_secs_f64() * self.config.exponential_base);

        if self.config.jitter {
            let jitter_amount = next_delay.as_secs_f64() * 0.1 * rand::random::<f64>();
            next_delay = Duration::from_secs_f64(next_delay.as_secs_f64() + jitter_amount);
        }

        next_delay.min(Duration::from_millis(self.config.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            jitter: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let result = policy
            .execute(
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("first attempt fails")
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);

        let result: Result<(), &str> = policy
            .execute(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("rejected")
                    }
                },
                |_| false,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let result: Result<(), &str> = tokio_test::block_on(policy.execute(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("unavailable")
                }
            },
            |_| true,
        ));

        tokio_test::assert_err!(result);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_delay_ms: 5000,
            jitter: false,
            ..Default::default()
        });

        assert_eq!(
            policy.calculate_next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.calculate_next_delay(Duration::from_secs(3)),
            Duration::from_secs(5)
        );
    }
}
