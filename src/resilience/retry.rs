use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::EngineError;

/// Immutable retry configuration for a single network operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Cap applied to the computed backoff
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Exponential growth factor between attempts
    pub multiplier: f64,

    /// Perturb each delay by up to ±25% to avoid thundering herds
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows `attempt` (1-based).
    ///
    /// `min(base * multiplier^(attempt-1), max)`, optionally jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential =
            self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);
        let millis = if self.jitter {
            capped * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Result of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, EngineError>,
    pub attempts: u32,
}

/// Run `op` under `policy`, retrying retryable failures with backoff.
///
/// Non-retryable errors (including local circuit-breaker rejections, which
/// must not consume retry budget) return immediately after the failing
/// attempt. Exhausted budgets return the last error observed.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "operation recovered after retry");
                }
                return RetryOutcome { result: Ok(value), attempts: attempt };
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::debug!(operation, attempt, %error, "not retrying non-retryable error");
            return RetryOutcome { result: Err(error), attempts: attempt };
        }
        if attempt >= policy.max_attempts {
            tracing::warn!(operation, attempts = attempt, %error, "retry budget exhausted");
            return RetryOutcome { result: Err(error), attempts: attempt };
        }

        let delay = match &error {
            // Honor a server-suggested delay when the engine sent one
            EngineError::RateLimited(_, Some(retry_after)) => (*retry_after).min(policy.max_delay),
            _ => policy.delay_for(attempt),
        };
        tracing::debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "retrying after backoff"
        );
        sleep(delay).await;
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::EngineError;

    fn plain_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn retryable_error() -> EngineError {
        EngineError::from_response(503, "{}", "/health", None)
    }

    fn non_retryable_error() -> EngineError {
        EngineError::from_response(404, "{}", "/ttt/status/j1", None)
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_retryable_uses_full_budget() {
        let calls = AtomicU32::new(0);
        let outcome = execute_with_retry(&plain_policy(4), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(retryable_error()) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_makes_exactly_one_attempt() {
        let calls = AtomicU32::new(0);
        let outcome = execute_with_retry(&plain_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(non_retryable_error()) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_open_does_not_consume_budget() {
        let calls = AtomicU32::new(0);
        let outcome = execute_with_retry(&plain_policy(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(EngineError::CircuitOpen { retry_in: Duration::from_secs(10) }) }
        })
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(EngineError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = execute_with_retry(&plain_policy(4), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(retryable_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_exponential_and_capped() {
        let start = tokio::time::Instant::now();
        let outcome = execute_with_retry(&plain_policy(4), "test", || async {
            Err::<(), _>(retryable_error())
        })
        .await;
        assert_eq!(outcome.attempts, 4);

        // Delays: 100ms, 200ms, 400ms (capped) = 700ms total
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = plain_policy(10);
        let mut previous = Duration::ZERO;
        for attempt in 1..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= policy.max_delay);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_25_percent() {
        let policy = RetryPolicy { jitter: true, ..plain_policy(3) };
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn honors_server_suggested_delay() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let outcome = execute_with_retry(&plain_policy(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(EngineError::from_response(
                    429,
                    "{}",
                    "/ttt/transcribe",
                    Some(Duration::from_millis(250)),
                ))
            }
        })
        .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
