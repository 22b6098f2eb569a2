//! Bounded retry with configurable backoff for collaborator I/O.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: i32 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: i32, multiplier: f64 },
}

impl BackoffConfig {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn calculate_delay_ms(&self, attempt_number: i32) -> i64 {
        if attempt_number <= 0 {
            return 0;
        }
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                (*base_delay_ms as i64) * (attempt_number as i64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                if *base_delay_ms <= 0 {
                    return 0;
                }
                // delay = base_delay * multiplier^(attempt - 1)
                let exp = (attempt_number - 1) as f64;
                let factor = multiplier.powf(exp);
                ((*base_delay_ms as f64) * factor) as i64
            }
        }
    }
}

/// Attempt budget plus backoff shape for one class of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 100,
                multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
            },
        }
    }
}

impl RetryPolicy {
    pub fn delay_before(&self, attempt_number: u32) -> Duration {
        let ms = self.backoff.calculate_delay_ms(attempt_number as i32 - 1);
        Duration::from_millis(ms.max(0) as u64)
    }
}

/// Run `op` until it succeeds or the policy's attempt budget is exhausted,
/// sleeping per the backoff shape between attempts. Returns the last error
/// when every attempt fails.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(attempt, max_attempts = attempts, error = %err, "retryable operation failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_none_always_returns_zero_delay() {
        let config = BackoffConfig::None;
        assert_eq!(config.calculate_delay_ms(0), 0);
        assert_eq!(config.calculate_delay_ms(1), 0);
        assert_eq!(config.calculate_delay_ms(10), 0);
    }

    #[test]
    fn backoff_linear_calculates_correctly() {
        // delay = base_delay * attempt_number
        let config = BackoffConfig::Linear {
            base_delay_ms: 1000,
        };
        assert_eq!(config.calculate_delay_ms(0), 0);
        assert_eq!(config.calculate_delay_ms(1), 1000);
        assert_eq!(config.calculate_delay_ms(2), 2000);
        assert_eq!(config.calculate_delay_ms(5), 5000);
    }

    #[test]
    fn backoff_exponential_calculates_correctly() {
        // delay = base_delay * multiplier^(attempt - 1)
        let config = BackoffConfig::Exponential {
            base_delay_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(config.calculate_delay_ms(0), 0);
        assert_eq!(config.calculate_delay_ms(1), 1000); // 1000 * 2^0
        assert_eq!(config.calculate_delay_ms(2), 2000); // 1000 * 2^1
        assert_eq!(config.calculate_delay_ms(3), 4000); // 1000 * 2^2
        assert_eq!(config.calculate_delay_ms(4), 8000); // 1000 * 2^3
    }

    #[test]
    fn backoff_handles_zero_base_delay() {
        let linear = BackoffConfig::Linear { base_delay_ms: 0 };
        assert_eq!(linear.calculate_delay_ms(5), 0);

        let exponential = BackoffConfig::Exponential {
            base_delay_ms: 0,
            multiplier: 2.0,
        };
        assert_eq!(exponential.calculate_delay_ms(5), 0);
    }

    #[test]
    fn policy_first_attempt_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert!(policy.delay_before(2) > Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffConfig::None,
        };
        let result: Result<u32, String> = retry(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffConfig::None,
        };
        let result: Result<(), String> = retry(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("attempt {n} failed")) }
        })
        .await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
