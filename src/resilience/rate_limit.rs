use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Sliding-window admission control against a known backend quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: usize,

    /// Rolling window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 10, window_secs: 3600 }
    }
}

impl RateLimitConfig {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// FIFO of request timestamps bounded to the rolling window.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, window: Mutex::new(VecDeque::new()) }
    }

    /// Whether another request fits in the current window.
    pub fn can_make_request(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut window, self.config.window());
        window.len() < self.config.max_requests
    }

    /// Record an admitted request. Call after a successful admission check.
    pub fn record_request(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut window, self.config.window());
        window.push_back(Instant::now());
    }

    /// Time until the oldest tracked request falls out of the window.
    /// Zero while under capacity.
    pub fn time_to_reset(&self) -> Duration {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut window, self.config.window());
        if window.len() < self.config.max_requests {
            return Duration::ZERO;
        }
        match window.front() {
            Some(oldest) => self.config.window().saturating_sub(oldest.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn evict(window: &mut VecDeque<Instant>, max_age: Duration) {
        let now = Instant::now();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= max_age {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}
