// crates/aqua-ledger/src/retry.rs
//
// Jittered exponential backoff for calls to fallible collaborators, plus a
// latency bound for store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use aqua_core::error::AquaError;

/// Retry policy for transient failures.
///
/// Each attempt is bounded by `attempt_timeout_ms`; an attempt that times out
/// counts as a transient `AllocationUnavailable` failure. Non-transient errors
/// are returned immediately. Dropping the returned future cancels the
/// in-flight attempt and any pending backoff sleep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> usize {
    5
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter_pct() -> f64 {
    0.2
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: default_jitter_pct(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_pct: f64,
        attempt_timeout_ms: u64,
    ) -> Self {
        let clamped_base = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: clamped_base,
            max_delay_ms: max_delay_ms.max(clamped_base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
            attempt_timeout_ms: attempt_timeout_ms.max(1),
        }
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jitter_pct = self.jitter_pct.clamp(0.0, 1.0);
        let jittered = if jitter_pct > 0.0 {
            let spread = (delay as f64 * jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay.saturating_add_signed(delta)
        } else {
            delay
        };
        Duration::from_millis(jittered)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    pub async fn retry_transient<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T, AquaError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, AquaError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempt_timeout = Duration::from_millis(self.attempt_timeout_ms.max(1));
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(AquaError::AllocationUnavailable(format!(
                    "{} timed out after {:?}",
                    what, attempt_timeout
                ))),
            };
            match result {
                Ok(val) => return Ok(val),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::warn!("{} failed after {} attempts: {}", what, attempt, err);
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        what,
                        attempt,
                        max_attempts,
                        err,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Bound a store call's latency.
///
/// # Errors
/// Returns `AquaError::StoreUnavailable` if `fut` does not finish in time.
pub async fn bounded<T, Fut>(timeout: Duration, what: &str, fut: Fut) -> Result<T, AquaError>
where
    Fut: Future<Output = Result<T, AquaError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AquaError::StoreUnavailable(format!(
            "{} exceeded {:?}",
            what, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, 1, 2, 0.0, 50)
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = fast()
            .retry_transient("fetch", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AquaError::AllocationUnavailable("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = fast()
            .retry_transient("fetch", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AquaError::NotFound("unit".into())) }
            })
            .await;
        assert!(matches!(result, Err(AquaError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_allocation_unavailable() {
        let result: Result<(), _> = fast()
            .retry_transient("fetch", |_| async {
                sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AquaError::AllocationUnavailable(_))));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Duration::from_millis(10), "read", async {
            sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AquaError::StoreUnavailable(_))));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, 100, 400, 0.0, 1_000);
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(5), Duration::from_millis(400));
    }
}
