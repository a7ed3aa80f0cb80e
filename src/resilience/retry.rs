//! Retry with Exponential Backoff
//! Used for connecting to the database and the message bus at startup

use crate::observability::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, jitter excluded.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

fn record(operation: &str, outcome: &str) {
    if let Some(m) = metrics::get() {
        m.retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

/// Execute an async function with retry logic
pub async fn with_retry_async<F, Fut, T, E>(
    operation: &str,
    config: &RetryConfig,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = operation, attempt = attempt, "Operation succeeded after retry");
                    record(operation, "recovered");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after all retries"
                    );
                    record(operation, "exhausted");
                    return Err(e);
                }

                let delay = config.backoff(attempt);
                let actual_delay = if config.jitter {
                    let spread = delay.as_millis() as u64 * 3 / 10;
                    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
                } else {
                    delay
                };

                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    delay_ms = actual_delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                record(operation, "retry");

                sleep(actual_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry_async("test", &fast(), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err("not yet".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry_async("test", &fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
