use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ApiError, EngineError};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// A memoized terminal failure for a resource key.
#[derive(Debug, Clone)]
pub struct CachedError {
    /// User-facing message describing the failure
    pub message: String,

    /// Structured API detail, when the failure carried one
    pub detail: Option<ApiError>,
}

#[derive(Debug)]
struct Entry {
    error: CachedError,
    cached_at: Instant,
}

/// Memoizes non-transient errors per resource key so known-bad inputs do not
/// burn retry budget on every attempt.
///
/// Only errors that cannot plausibly resolve on their own are stored:
/// non-retryable, not a timeout/quota/5xx class status, and not mentioning a
/// transient condition. Entries expire lazily after a fixed TTL.
#[derive(Debug)]
pub struct ErrorCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for ErrorCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ErrorCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Store `error` under `key` if it is cacheable. Non-cacheable errors are
    /// silently ignored.
    pub fn cache_error(&self, key: &str, error: &EngineError) {
        if !Self::is_cacheable(error) {
            return;
        }
        let cached = CachedError {
            message: error.to_string(),
            detail: error.api_error().cloned(),
        };
        tracing::debug!(key, message = %cached.message, "caching terminal error");
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), Entry { error: cached, cached_at: Instant::now() });
    }

    /// Look up a still-fresh cached error for `key`.
    pub fn get_cached_error(&self, key: &str) -> Option<CachedError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.error.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn has_cached_error(&self, key: &str) -> bool {
        self.get_cached_error(key).is_some()
    }

    pub fn clear_cache(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Cacheable means the failure is terminal for this input: retrying it,
    /// now or soon, cannot succeed.
    fn is_cacheable(error: &EngineError) -> bool {
        if error.is_retryable() {
            return false;
        }
        if let Some(status) = error.status() {
            if status == 408 || status == 429 || status >= 500 {
                return false;
            }
        }
        // Local rejections and anything hinting at a transient condition
        // stay out of the cache
        let message = error.to_string().to_lowercase();
        !(message.contains("timeout")
            || message.contains("timed out")
            || message.contains("circuit breaker")
            || message.contains("quota")
            || message.contains("temporarily")
            || message.contains("unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> EngineError {
        EngineError::from_response(404, r#"{"message":"video not found"}"#, "/meta", None)
    }

    #[tokio::test(start_paused = true)]
    async fn caches_non_retryable_client_error() {
        let cache = ErrorCache::default();
        cache.cache_error("https://example.test/v/1", &not_found());

        assert!(cache.has_cached_error("https://example.test/v/1"));
        let cached = cache.get_cached_error("https://example.test/v/1").expect("entry");
        assert_eq!(cached.detail.as_ref().map(|d| d.status), Some(404));
        assert!(cached.message.contains("video not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let cache = ErrorCache::default();
        cache.cache_error("k", &not_found());
        assert!(cache.has_cached_error("k"));

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(!cache.has_cached_error("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn skips_retryable_and_transient_errors() {
        let cache = ErrorCache::default();

        cache.cache_error("a", &EngineError::from_response(503, "{}", "/health", None));
        assert!(!cache.has_cached_error("a"));

        cache.cache_error("b", &EngineError::from_response(429, "{}", "/ttt/transcribe", None));
        assert!(!cache.has_cached_error("b"));

        cache.cache_error(
            "c",
            &EngineError::CircuitOpen { retry_in: Duration::from_secs(10) },
        );
        assert!(!cache.has_cached_error("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_removes_entry() {
        let cache = ErrorCache::default();
        cache.cache_error("k", &not_found());
        cache.clear_cache("k");
        assert!(!cache.has_cached_error("k"));
    }
}
