use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Thresholds and cooldown for the circuit breaker.
///
/// Transient retryable blips (timeouts, 5xx) get a higher threshold than
/// persistent non-retryable failures, which indicate something structurally
/// wrong and should trip the breaker sooner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive retryable failures before opening
    pub retryable_threshold: u32,

    /// Consecutive non-retryable failures before opening
    pub non_retryable_threshold: u32,

    /// How long the breaker stays open before closing again
    #[serde(with = "duration_secs")]
    pub reset_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            retryable_threshold: 8,
            non_retryable_threshold: 5,
            reset_window: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker with half-open-by-reset semantics.
///
/// Once open, calls are rejected locally until `reset_window` elapses, at
/// which point the breaker simply closes and counters reset. There is no
/// single-probe half-open state.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, state: Mutex::new(BreakerState::default()) }
    }

    /// Whether calls should currently be rejected without attempting them.
    ///
    /// Clears the open state as a side effect once the cooldown has elapsed.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.opened_at {
            None => false,
            Some(opened_at) => {
                if opened_at.elapsed() > self.config.reset_window {
                    tracing::info!(
                        cooldown_secs = self.config.reset_window.as_secs(),
                        "circuit breaker cooldown elapsed, closing"
                    );
                    state.opened_at = None;
                    state.consecutive_failures = 0;
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Time left until an open breaker closes. Zero when closed.
    pub fn time_until_close(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.opened_at {
            Some(opened_at) => self.config.reset_window.saturating_sub(opened_at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Record a successful call: the failure streak resets, but an already
    /// open breaker stays open for the remainder of its cooldown.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures = 0;
    }

    /// Record a failed call, opening the breaker once the streak reaches the
    /// threshold for the failure's class.
    pub fn record_failure(&self, retryable: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        let threshold = if retryable {
            self.config.retryable_threshold
        } else {
            self.config.non_retryable_threshold
        };
        if state.consecutive_failures >= threshold && state.opened_at.is_none() {
            tracing::warn!(
                failures = state.consecutive_failures,
                retryable,
                "circuit breaker opening"
            );
            state.opened_at = Some(Instant::now());
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
