//! Request metrics and the background health probe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::EngineApi;

/// Counters for every request that passes through the client.
///
/// Plain relaxed atomics: the counts feed logs and the `health` command,
/// nothing orders against them.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    throttled: AtomicU64,
    circuit_rejections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one logical request that took `attempts` tries.
    pub fn record(&self, attempts: u32, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if attempts > 1 {
            self.retries.fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
        }
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let retries = self.retries.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries,
            throttled: self.throttled.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            average_retries: if requests == 0 {
                0.0
            } else {
                retries as f64 / requests as f64
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub throttled: u64,
    pub circuit_rejections: u64,
    pub average_retries: f64,
}

/// Engine health as seen by the background probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe has completed yet.
    Unknown,
    Healthy,
    /// The engine answered but reported a non-ok status.
    Degraded,
    /// The probe failed outright.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// Probes `GET /health` on a fixed interval and publishes the latest status.
pub struct HealthMonitor {
    status: watch::Receiver<HealthStatus>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the probe loop. The first probe runs immediately, then every
    /// `interval`.
    pub fn spawn(api: Arc<dyn EngineApi>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(HealthStatus::Unknown);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let status = probe(api.as_ref()).await;
                if *tx.borrow() != status {
                    tracing::info!(%status, "engine health changed");
                }
                let _ = tx.send(status);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self { status: rx, cancel, handle }
    }

    /// Latest published status.
    pub fn status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    /// Wait until the first probe has completed, then return its result.
    pub async fn wait_for_first_probe(&mut self) -> HealthStatus {
        while *self.status.borrow() == HealthStatus::Unknown {
            if self.status.changed().await.is_err() {
                break;
            }
        }
        *self.status.borrow()
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn probe(api: &dyn EngineApi) -> HealthStatus {
    match api.health().await {
        Ok(health) if health.is_healthy() => HealthStatus::Healthy,
        Ok(health) => {
            tracing::warn!(status = %health.status, "engine reports degraded health");
            HealthStatus::Degraded
        }
        Err(error) => {
            tracing::warn!(%error, "engine health probe failed");
            HealthStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HealthResponse, MockEngineApi};
    use crate::error::EngineError;

    fn health_body(status: &str) -> HealthResponse {
        serde_json::from_value(serde_json::json!({ "status": status })).expect("health body")
    }

    #[test]
    fn snapshot_averages_retries_over_requests() {
        let metrics = Metrics::new();
        metrics.record(3, true);
        metrics.record(1, true);
        metrics.record(2, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.retries, 3);
        assert!((snapshot.average_retries - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.average_retries, 0.0);
    }

    #[tokio::test]
    async fn first_probe_publishes_healthy() {
        let mut api = MockEngineApi::new();
        api.expect_health().returning(|| Ok(health_body("ok")));

        let mut monitor = HealthMonitor::spawn(Arc::new(api), Duration::from_secs(30));
        assert_eq!(monitor.wait_for_first_probe().await, HealthStatus::Healthy);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn failed_probe_publishes_unhealthy() {
        let mut api = MockEngineApi::new();
        api.expect_health().returning(|| {
            Err(EngineError::from_response(503, "{}", "/health", None))
        });

        let mut monitor = HealthMonitor::spawn(Arc::new(api), Duration::from_secs(30));
        assert_eq!(monitor.wait_for_first_probe().await, HealthStatus::Unhealthy);
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_transitions_on_later_probes() {
        let mut api = MockEngineApi::new();
        api.expect_health().times(1).returning(|| Ok(health_body("ok")));
        api.expect_health()
            .returning(|| Ok(health_body("draining")));

        let mut monitor = HealthMonitor::spawn(Arc::new(api), Duration::from_secs(30));
        assert_eq!(monitor.wait_for_first_probe().await, HealthStatus::Healthy);

        tokio::time::advance(Duration::from_secs(31)).await;
        // Let the probe task run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(monitor.status(), HealthStatus::Degraded);

        monitor.shutdown().await;
    }
}
