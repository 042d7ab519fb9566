use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EngineError;

/// Safety margin: a token this close to expiry is treated as already expired
const EXPIRY_LEEWAY_SECS: i64 = 60;

/// Floor applied to server-reported TTLs
const MIN_TTL_SECS: u64 = 60;

/// The persisted `{token, expiresAt}` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl StoredToken {
    fn is_valid(&self) -> bool {
        Utc::now() + ChronoDuration::seconds(EXPIRY_LEEWAY_SECS) < self.expires_at
    }
}

/// Caches the ephemeral service token the engine vends in exchange for
/// credit.
///
/// Holds an in-memory copy plus a persisted one that survives restarts.
/// (Re)population is serialized through the inner mutex so concurrent
/// sessions on an empty cache trigger a single vend round trip; the losers
/// reuse the freshly cached result.
#[derive(Debug)]
pub struct ServiceTokenCache {
    path: Option<PathBuf>,
    inner: Mutex<Option<StoredToken>>,
}

impl ServiceTokenCache {
    /// In-memory only cache, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self { path: None, inner: Mutex::new(None) }
    }

    /// Cache backed by `path`. An existing persisted token is loaded and
    /// validated; an already-expired copy is discarded on the spot.
    pub fn with_storage(path: PathBuf) -> Self {
        let stored = Self::load_from(&path);
        Self { path: Some(path), inner: Mutex::new(stored) }
    }

    fn load_from(path: &PathBuf) -> Option<StoredToken> {
        let raw = fs_err::read_to_string(path).ok()?;
        let stored: StoredToken = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "discarding unreadable persisted token");
                return None;
            }
        };
        if stored.is_valid() {
            tracing::debug!(expires_at = %stored.expires_at, "loaded persisted service token");
            Some(stored)
        } else {
            tracing::debug!("persisted service token already expired, discarding");
            let _ = fs_err::remove_file(path);
            None
        }
    }

    /// The cached token, if one exists and stays valid past the leeway
    /// window.
    pub async fn get_valid_token(&self) -> Option<String> {
        let mut slot = self.inner.lock().await;
        match slot.as_ref() {
            Some(stored) if stored.is_valid() => Some(stored.token.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    /// Cache `token` for `ttl_seconds` (floored to one minute), writing both
    /// the in-memory and persisted copies.
    pub async fn cache_token(&self, token: &str, ttl_seconds: u64) {
        let ttl = ttl_seconds.max(MIN_TTL_SECS);
        let stored = StoredToken {
            token: token.to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl as i64),
        };
        let mut slot = self.inner.lock().await;
        self.persist(&stored);
        *slot = Some(stored);
    }

    /// Drop the cached token everywhere. The next caller vends a fresh one.
    pub async fn clear_token(&self) {
        let mut slot = self.inner.lock().await;
        *slot = None;
        if let Some(path) = &self.path {
            let _ = fs_err::remove_file(path);
        }
    }

    /// Return the cached token or run `vend` to obtain and cache a new one.
    ///
    /// The cache lock is held across the vend call: concurrent callers on an
    /// empty cache queue up behind the one doing the round trip and receive
    /// its result from the cache.
    pub async fn get_or_vend<F, Fut>(&self, vend: F) -> Result<String, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, u64), EngineError>>,
    {
        let mut slot = self.inner.lock().await;
        if let Some(stored) = slot.as_ref() {
            if stored.is_valid() {
                tracing::debug!("reusing cached service token");
                return Ok(stored.token.clone());
            }
            *slot = None;
        }

        let (token, ttl_seconds) = vend().await?;
        let stored = StoredToken {
            token: token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_seconds.max(MIN_TTL_SECS) as i64),
        };
        self.persist(&stored);
        *slot = Some(stored);
        Ok(token)
    }

    fn persist(&self, stored: &StoredToken) {
        let Some(path) = &self.path else { return };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let json = serde_json::to_string(stored)?;
            fs_err::write(path, json)?;
            Ok(())
        };
        if let Err(error) = write() {
            // A failed write degrades to in-memory caching only
            tracing::warn!(%error, path = %path.display(), "failed to persist service token");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio_test::assert_err;

    use super::*;

    #[tokio::test]
    async fn empty_cache_returns_none() {
        let cache = ServiceTokenCache::in_memory();
        assert_eq!(cache.get_valid_token().await, None);
    }

    #[tokio::test]
    async fn cache_then_get_returns_token() {
        let cache = ServiceTokenCache::in_memory();
        cache.cache_token("svc-token-1", 900).await;
        assert_eq!(cache.get_valid_token().await.as_deref(), Some("svc-token-1"));
    }

    #[tokio::test]
    async fn token_inside_leeway_window_is_invalid() {
        let cache = ServiceTokenCache::in_memory();
        // Floored to 60s, which is entirely consumed by the leeway window
        cache.cache_token("svc-token-1", 10).await;
        assert_eq!(cache.get_valid_token().await, None);
    }

    #[tokio::test]
    async fn clear_removes_token() {
        let cache = ServiceTokenCache::in_memory();
        cache.cache_token("svc-token-1", 900).await;
        cache.clear_token().await;
        assert_eq!(cache.get_valid_token().await, None);
    }

    #[tokio::test]
    async fn persisted_token_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service_token.json");

        {
            let cache = ServiceTokenCache::with_storage(path.clone());
            cache.cache_token("svc-token-1", 900).await;
        }

        let reloaded = ServiceTokenCache::with_storage(path);
        assert_eq!(reloaded.get_valid_token().await.as_deref(), Some("svc-token-1"));
    }

    #[tokio::test]
    async fn expired_persisted_token_is_discarded_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service_token.json");

        let stale = StoredToken {
            token: "stale".to_string(),
            expires_at: Utc::now() - ChronoDuration::seconds(10),
        };
        fs_err::write(&path, serde_json::to_string(&stale).expect("serialize")).expect("write");

        let cache = ServiceTokenCache::with_storage(path.clone());
        assert_eq!(cache.get_valid_token().await, None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn concurrent_get_or_vend_makes_one_round_trip() {
        let cache = Arc::new(ServiceTokenCache::in_memory());
        let vend_calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let vend_calls = Arc::clone(&vend_calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_vend(|| async move {
                        vend_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(("vended".to_string(), 900))
                    })
                    .await
            }));
        }

        for handle in handles {
            let token = handle.await.expect("task").expect("vend ok");
            assert_eq!(token, "vended");
        }
        assert_eq!(vend_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_vend_propagates_vend_failure() {
        let cache = ServiceTokenCache::in_memory();
        let result = cache
            .get_or_vend(|| async {
                Err(crate::error::EngineError::from_response(502, "{}", "/v1/vend-token", None))
            })
            .await;
        assert_err!(result);
        assert_eq!(cache.get_valid_token().await, None);
    }
}
