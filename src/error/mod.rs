use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How much of a failed response body we keep for diagnostics
const BODY_SNIPPET_LEN: usize = 300;

/// Structured detail for a failed Business Engine call.
///
/// Carries everything needed to diagnose the failure without re-running the
/// request: the endpoint, the engine's error code/message, and any upstream
/// (proxied service) status the engine surfaced in its `details` object.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status returned by the engine
    pub status: u16,

    /// Engine-specific error code, if the body carried one
    pub error_code: Option<String>,

    /// Human-readable message extracted from the body
    pub message: String,

    /// HTTP status of the upstream service the engine proxied to
    pub upstream_status: Option<u16>,

    /// Upstream error message, if reported
    pub upstream_message: Option<String>,

    /// Raw response body (truncated for storage)
    pub response_body: String,

    /// Endpoint path the request targeted
    pub endpoint: String,

    /// Whether the status classification permits a retry
    pub retryable: bool,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} from {}: {}", self.status, self.endpoint, self.message)?;
        if let Some(upstream) = self.upstream_status {
            write!(f, " (upstream {}", upstream)?;
            if let Some(msg) = &self.upstream_message {
                write!(f, ": {}", msg)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Error taxonomy for every engine interaction.
///
/// Classification drives the retry executor: `Network`, `RateLimited` and
/// `Server` retry with backoff; `Authentication`, `Client` and `Parse` never
/// do. `CircuitOpen` and `Throttled` are local rejections that consume no
/// retry budget and never count against the circuit breaker.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level failure: timeout, unreachable host, reset, TLS.
    #[error("network error calling {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP 401. Handled by the re-authentication path, never blind retry.
    #[error("authentication failed on {}: {}", .0.endpoint, .0.message)]
    Authentication(ApiError),

    /// HTTP 429. Retryable; `retry_after` carries a server-suggested delay.
    #[error("rate limited on {}: {}", .0.endpoint, .0.message)]
    RateLimited(ApiError, Option<Duration>),

    /// HTTP 5xx (and 408). Transient engine trouble, retryable.
    #[error("server error on {}: {}", .0.endpoint, .0)]
    Server(ApiError),

    /// Remaining 4xx (402/403/404/405/...). Not retryable.
    #[error("client error on {}: {}", .0.endpoint, .0)]
    Client(ApiError),

    /// A 2xx response that did not match the endpoint's canonical schema.
    #[error("unexpected {operation} response: {source} (expected {expected}; got: {body})")]
    Parse {
        /// Logical operation name (balance, vend-token, submit, ...)
        operation: &'static str,
        /// Description of the schema we tried to deserialize into
        expected: &'static str,
        /// Truncated copy of the body that failed to parse
        body: String,
        #[source]
        source: serde_json::Error,
    },

    /// Local circuit-breaker rejection; the call was never attempted.
    #[error("circuit breaker open; retrying in {}s", retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },

    /// Local sliding-window admission rejection.
    #[error("request quota reached; window resets in {}s", reset_in.as_secs())]
    Throttled { reset_in: Duration },
}

impl EngineError {
    /// Whether the retry executor may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network { .. } => true,
            EngineError::RateLimited(..) => true,
            EngineError::Server(_) => true,
            EngineError::Authentication(_) => false,
            EngineError::Client(_) => false,
            EngineError::Parse { .. } => false,
            EngineError::CircuitOpen { .. } => false,
            EngineError::Throttled { .. } => false,
        }
    }

    /// Whether this failure should count toward opening the circuit breaker.
    ///
    /// Local rejections never count (they reflect our own state, not the
    /// dependency's), and neither do plain client errors other than 408/429,
    /// which say more about the request than about engine health.
    pub fn counts_for_breaker(&self) -> bool {
        match self {
            EngineError::CircuitOpen { .. } | EngineError::Throttled { .. } => false,
            EngineError::Client(api) => api.status == 408 || api.status == 429,
            EngineError::Parse { .. } => false,
            _ => true,
        }
    }

    /// The engine's HTTP status, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        self.api_error().map(|api| api.status)
    }

    /// Structured API detail, when this error carries one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            EngineError::Authentication(api)
            | EngineError::RateLimited(api, _)
            | EngineError::Server(api)
            | EngineError::Client(api) => Some(api),
            _ => None,
        }
    }

    /// Whether this looks like a timeout the server may have survived.
    ///
    /// Used by the submit recovery path: a gateway timeout can mean the job
    /// was accepted even though the client never saw the 202.
    pub fn is_timeout(&self) -> bool {
        match self {
            EngineError::Network { source, .. } => source.is_timeout(),
            _ => {
                if let Some(api) = self.api_error() {
                    if api.status == 408 || api.status == 504 {
                        return true;
                    }
                    if let Some(code) = &api.error_code {
                        if code.to_lowercase().contains("timeout") {
                            return true;
                        }
                    }
                    let msg = api.message.to_lowercase();
                    msg.contains("timeout") || msg.contains("timed out")
                } else {
                    false
                }
            }
        }
    }

    /// Classify a non-2xx response into the taxonomy.
    ///
    /// The body is first parsed as the engine's JSON error envelope
    /// (`code`/`message` plus a nested `details` object with upstream
    /// diagnostics); if that fails, quoted `"error"`/`"message"` values are
    /// scavenged from the raw text.
    pub fn from_response(
        status: u16,
        body: &str,
        endpoint: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let parsed: Option<ErrorEnvelope> = serde_json::from_str(body).ok();

        let (error_code, message, upstream_status, upstream_message) = match parsed {
            Some(envelope) => {
                let details = envelope.details.unwrap_or_default();
                let upstream_message = details.upstream_message.or(details.upstream_response);
                (
                    envelope.code,
                    envelope
                        .message
                        .or(envelope.error)
                        .unwrap_or_else(|| format!("HTTP {}", status)),
                    details.upstream_status,
                    upstream_message,
                )
            }
            None => {
                let message = extract_quoted_field(body, "error")
                    .or_else(|| extract_quoted_field(body, "message"))
                    .unwrap_or_else(|| format!("HTTP {}", status));
                (None, message, None, None)
            }
        };

        let api = ApiError {
            status,
            error_code,
            message,
            upstream_status,
            upstream_message,
            response_body: truncate(body, BODY_SNIPPET_LEN),
            endpoint: endpoint.to_string(),
            retryable: retryable_status(status),
        };

        match status {
            401 => EngineError::Authentication(api),
            429 => EngineError::RateLimited(api, retry_after),
            408 => EngineError::Server(api),
            s if s >= 500 => EngineError::Server(api),
            _ => EngineError::Client(api),
        }
    }

    /// Wrap a schema mismatch on a 2xx body with enough context to diagnose
    /// it offline.
    pub fn parse_failure(
        operation: &'static str,
        expected: &'static str,
        body: &str,
        source: serde_json::Error,
    ) -> Self {
        EngineError::Parse {
            operation,
            expected,
            body: truncate(body, BODY_SNIPPET_LEN),
            source,
        }
    }
}

/// Status codes the documented contract marks retryable.
pub fn retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// The engine's JSON error envelope, with field variants reconciled.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
    details: Option<ErrorDetails>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetails {
    upstream_status: Option<u16>,
    upstream_response: Option<String>,
    #[serde(rename = "upstreamError")]
    upstream_message: Option<String>,
}

/// Pull a `"field":"value"` pair out of a non-JSON body.
fn extract_quoted_field(body: &str, field: &str) -> Option<String> {
    let needle = format!("\"{}\"", field);
    let start = body.find(&needle)? + needle.len();
    let rest = &body[start..];
    let open = rest.find('"')? + 1;
    let rest = &rest[open..];
    let close = rest.find('"')?;
    let value = &rest[..close];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        body.to_string()
    } else {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}
