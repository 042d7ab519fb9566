//! HTTP client for the Business Engine.
//!
//! Every remote call flows through one path: rate-limit admission, then the
//! retry executor, with each attempt gated by the circuit breaker. The
//! [`EngineApi`] trait is the seam the workflow orchestrator talks through,
//! so it can be exercised against a mock engine.

pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::auth::CredentialGenerator;
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::monitor::Metrics;
use crate::resilience::{execute_with_retry, CircuitBreaker, RateLimiter, RetryPolicy};

pub use types::{
    CreditBalance, HealthResponse, JobStatus, JobSubmit, SubmitRequest, TranscriptionResult,
    VendToken, VideoMetadata,
};

const USER_AGENT: &str = concat!("pluct/", env!("CARGO_PKG_VERSION"));

/// The engine operations the workflow depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn health(&self) -> Result<HealthResponse, EngineError>;
    async fn credit_balance(&self) -> Result<CreditBalance, EngineError>;
    async fn vend_token(&self) -> Result<VendToken, EngineError>;
    async fn video_metadata(&self, url: &str) -> Result<VideoMetadata, EngineError>;
    async fn submit(
        &self,
        url: &str,
        service_token: &str,
        client_request_id: &str,
    ) -> Result<JobSubmit, EngineError>;
    async fn job_status(&self, job_id: &str, service_token: &str)
        -> Result<JobStatus, EngineError>;
}

/// Which credential a request carries.
#[derive(Debug, Clone)]
enum Auth {
    /// No Authorization header (health probe).
    None,
    /// A freshly minted user JWT.
    User,
    /// A vended service token.
    Service(String),
}

/// One logical request, rebuilt per retry attempt.
struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
    auth: Auth,
    /// Name used in logs and error context.
    operation: &'static str,
}

pub struct EngineClient {
    http: reqwest::Client,
    settings: EngineSettings,
    credentials: CredentialGenerator,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
}

impl EngineClient {
    pub fn new(
        settings: EngineSettings,
        retry: RetryPolicy,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| EngineError::Network {
                endpoint: settings.base_url.clone(),
                source,
            })?;
        let credentials = CredentialGenerator::new(&settings.shared_secret);
        Ok(Self { http, settings, credentials, retry, limiter, breaker, metrics })
    }

    /// Run `spec` through admission control, the retry executor, and the
    /// breaker, recording metrics for the overall outcome.
    async fn call<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, EngineError> {
        if !self.limiter.can_make_request() {
            let reset_in = self.limiter.time_to_reset();
            tracing::warn!(
                operation = spec.operation,
                reset_in_secs = reset_in.as_secs(),
                "local rate limit reached, rejecting request"
            );
            self.metrics.record_throttled();
            return Err(EngineError::Throttled { reset_in });
        }
        self.limiter.record_request();

        let outcome =
            execute_with_retry(&self.retry, spec.operation, || self.dispatch(&spec)).await;
        self.metrics.record(outcome.attempts, outcome.result.is_ok());
        outcome.result
    }

    /// One attempt: breaker gate, send, classify, record.
    async fn dispatch<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, EngineError> {
        if self.breaker.is_open() {
            let retry_in = self.breaker.time_until_close();
            tracing::debug!(
                operation = spec.operation,
                retry_in_secs = retry_in.as_secs(),
                "circuit breaker open, rejecting attempt"
            );
            self.metrics.record_circuit_rejection();
            return Err(EngineError::CircuitOpen { retry_in });
        }

        let result = self.send(spec).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(error) if error.counts_for_breaker() => {
                self.breaker.record_failure(error.is_retryable());
            }
            // Plain 4xx and local rejections say nothing about engine health
            Err(_) => {}
        }
        result
    }

    async fn send<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, EngineError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), spec.path);
        let mut request = self
            .http
            .request(spec.method.clone(), &url)
            .header("Accept", "application/json")
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .header("X-Client-Version", env!("CARGO_PKG_VERSION"))
            .header("X-Client-Platform", "cli")
            .header("X-User-Id", &self.settings.user_id)
            .query(&spec.query);

        request = match &spec.auth {
            Auth::None => request,
            Auth::User => {
                let jwt = self.credentials.generate(&self.settings.user_id);
                request.bearer_auth(jwt.compact)
            }
            Auth::Service(token) => request.bearer_auth(token),
        };
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| EngineError::Network {
            endpoint: spec.path.clone(),
            source,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| EngineError::Network {
            endpoint: spec.path.clone(),
            source,
        })?;

        if !status.is_success() {
            let retry_after = parse_retry_after(&body, status);
            return Err(EngineError::from_response(
                status.as_u16(),
                &body,
                &spec.path,
                retry_after,
            ));
        }

        serde_json::from_str(&body).map_err(|source| {
            EngineError::parse_failure(spec.operation, std::any::type_name::<T>(), &body, source)
        })
    }
}

/// Scavenge a retry delay from a 429 body (`retryAfter` in seconds).
fn parse_retry_after(body: &str, status: StatusCode) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let secs = value
        .get("retryAfter")
        .or_else(|| value.get("retry_after"))
        .and_then(|v| v.as_u64())?;
    Some(Duration::from_secs(secs))
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn health(&self) -> Result<HealthResponse, EngineError> {
        self.call(RequestSpec {
            method: Method::GET,
            path: "/health".to_string(),
            query: Vec::new(),
            body: None,
            auth: Auth::None,
            operation: "health",
        })
        .await
    }

    async fn credit_balance(&self) -> Result<CreditBalance, EngineError> {
        self.call(RequestSpec {
            method: Method::GET,
            path: "/v1/credits/balance".to_string(),
            query: Vec::new(),
            body: None,
            auth: Auth::User,
            operation: "credit_balance",
        })
        .await
    }

    async fn vend_token(&self) -> Result<VendToken, EngineError> {
        self.call(RequestSpec {
            method: Method::POST,
            path: "/v1/vend-token".to_string(),
            query: Vec::new(),
            body: Some(serde_json::json!({})),
            auth: Auth::User,
            operation: "vend_token",
        })
        .await
    }

    async fn video_metadata(&self, url: &str) -> Result<VideoMetadata, EngineError> {
        self.call(RequestSpec {
            method: Method::GET,
            path: "/meta".to_string(),
            query: vec![("url", url.to_string())],
            body: None,
            auth: Auth::User,
            operation: "video_metadata",
        })
        .await
    }

    async fn submit(
        &self,
        url: &str,
        service_token: &str,
        client_request_id: &str,
    ) -> Result<JobSubmit, EngineError> {
        let body = SubmitRequest {
            url: url.to_string(),
            client_request_id: Some(client_request_id.to_string()),
        };
        self.call(RequestSpec {
            method: Method::POST,
            path: "/ttt/transcribe".to_string(),
            query: Vec::new(),
            body: Some(serde_json::to_value(&body).unwrap_or_default()),
            auth: Auth::Service(service_token.to_string()),
            operation: "submit",
        })
        .await
    }

    async fn job_status(
        &self,
        job_id: &str,
        service_token: &str,
    ) -> Result<JobStatus, EngineError> {
        self.call(RequestSpec {
            method: Method::GET,
            path: format!("/ttt/status/{}", urlencoding::encode(job_id)),
            query: Vec::new(),
            body: None,
            auth: Auth::Service(service_token.to_string()),
            operation: "job_status",
        })
        .await
    }
}
