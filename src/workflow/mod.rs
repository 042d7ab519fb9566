//! Transcription workflow state machine.
//!
//! Drives one URL through metadata, balance check, token vend, submission,
//! and polling. Progress is published as a finite sequence of stage events;
//! every terminal path ends the session, and a new transcription needs a
//! new session.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::ServiceTokenCache;
use crate::client::{EngineApi, TranscriptionResult};
use crate::error::EngineError;
use crate::resilience::ErrorCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Metadata,
    BalanceCheck,
    VendToken,
    Submit,
    Polling,
    Completed,
    Failed,
    Timeout,
}

impl Stage {
    fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Timeout)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Init => "INIT",
            Stage::Metadata => "METADATA",
            Stage::BalanceCheck => "BALANCE_CHECK",
            Stage::VendToken => "VEND_TOKEN",
            Stage::Submit => "SUBMIT",
            Stage::Polling => "POLLING",
            Stage::Completed => "COMPLETED",
            Stage::Failed => "FAILED",
            Stage::Timeout => "TIMEOUT",
        };
        f.write_str(label)
    }
}

/// Detail attached to a `POLLING` event.
#[derive(Debug, Clone, Serialize)]
pub struct PollUpdate {
    pub attempt: u32,
    pub max_attempts: u32,
    pub status: String,
    pub progress: Option<u8>,
}

/// One entry in the session's progress stream.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowEvent {
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollUpdate>,
}

/// User-facing failure category, shown instead of the raw error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    InsufficientCredits,
    AuthenticationFailed,
    ServiceUnavailable,
    RateLimited,
    InvalidRequest,
    JobFailed,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::InsufficientCredits => "insufficient_credits",
            FailureCategory::AuthenticationFailed => "authentication_failed",
            FailureCategory::ServiceUnavailable => "service_unavailable",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::InvalidRequest => "invalid_request",
            FailureCategory::JobFailed => "job_failed",
            FailureCategory::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one workflow session.
#[derive(Debug)]
pub enum WorkflowOutcome {
    Completed(TranscriptionResult),
    Failed { category: FailureCategory, message: String },
    TimedOut { job_id: String, attempts: u32 },
}

/// Timing knobs for the poll loop.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 3, max_poll_attempts: 160 }
    }
}

/// Per-session state. Owned by the task running the workflow; stage
/// transitions only ever move forward, with the failure short-circuit as
/// the one exception.
struct WorkflowSession {
    job_id: Option<String>,
    stage: Stage,
    poll_attempt: u32,
    last_status: Option<String>,
    /// A session gets exactly one token refresh, no matter which phase the
    /// 401 arrives in. A second 401 means the engine has rejected the
    /// session itself, and re-vending again would spend another credit.
    refreshed_token: bool,
}

impl WorkflowSession {
    fn new() -> Self {
        Self {
            job_id: None,
            stage: Stage::Init,
            poll_attempt: 0,
            last_status: None,
            refreshed_token: false,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(
            next >= self.stage || next.is_terminal(),
            "stage regression: {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
    }
}

pub struct TranscriptionWorkflow {
    api: Arc<dyn EngineApi>,
    tokens: Arc<ServiceTokenCache>,
    errors: Arc<ErrorCache>,
    config: WorkflowConfig,
}

impl TranscriptionWorkflow {
    pub fn new(
        api: Arc<dyn EngineApi>,
        tokens: Arc<ServiceTokenCache>,
        errors: Arc<ErrorCache>,
        config: WorkflowConfig,
    ) -> Self {
        Self { api, tokens, errors, config }
    }

    /// Run one session for `url`, publishing stage events to `events`.
    pub async fn run(
        &self,
        url: &str,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
        cancel: &CancellationToken,
    ) -> WorkflowOutcome {
        let mut session = WorkflowSession::new();

        if let Some(cached) = self.errors.get_cached_error(url) {
            tracing::info!(url, "skipping request with recently failed terminal error");
            return self.fail(
                &mut session,
                events,
                categorize_cached(&cached),
                format!("previously failed: {}", cached.message),
            );
        }

        // Metadata is display garnish, failure here never stops the run
        session.advance(Stage::Metadata);
        emit(events, Stage::Metadata, "fetching video metadata");
        let metadata = match self.api.video_metadata(url).await {
            Ok(meta) => Some(meta),
            Err(error) => {
                tracing::warn!(%error, "metadata fetch failed, continuing with placeholders");
                None
            }
        };
        let title = metadata
            .as_ref()
            .and_then(|m| m.title.clone())
            .unwrap_or_else(|| "(unknown title)".to_string());
        tracing::debug!(url, title, "starting transcription workflow");

        session.advance(Stage::BalanceCheck);
        emit(events, Stage::BalanceCheck, "checking credit balance");
        match self.api.credit_balance().await {
            Ok(balance) if balance.balance <= 0 => {
                return self.fail(
                    &mut session,
                    events,
                    FailureCategory::InsufficientCredits,
                    format!("credit balance is {}", balance.balance),
                );
            }
            Ok(balance) => {
                tracing::debug!(balance = balance.balance, "credit balance ok");
            }
            Err(error) => return self.fail_with_error(&mut session, events, url, error),
        }

        session.advance(Stage::VendToken);
        emit(events, Stage::VendToken, "acquiring service token");
        let mut service_token = match self.vend_service_token().await {
            Ok(token) => token,
            Err(error) => return self.fail_with_error(&mut session, events, url, error),
        };

        session.advance(Stage::Submit);
        emit(events, Stage::Submit, "submitting transcription job");
        let client_request_id = Uuid::new_v4().to_string();
        let job_id = match self.api.submit(url, &service_token, &client_request_id).await {
            Ok(submit) => submit.job_id,
            Err(error) => {
                match self
                    .recover_submit(&mut session, url, &client_request_id, &mut service_token, &error)
                    .await
                {
                    Ok(Some(job_id)) => job_id,
                    Ok(None) => return self.fail_with_error(&mut session, events, url, error),
                    Err(second) => {
                        return self.fail_with_error(&mut session, events, url, second)
                    }
                }
            }
        };
        session.job_id = Some(job_id.clone());

        self.poll(&mut session, events, cancel, url, &job_id, service_token).await
    }

    /// Vend a token through the cache, validating the response shape.
    async fn vend_service_token(&self) -> Result<String, EngineError> {
        self.tokens
            .get_or_vend(|| async {
                let vend = self.api.vend_token().await?;
                match vend.service_token() {
                    Some(token) => {
                        if let Some(balance) = vend.balance_after {
                            tracing::debug!(balance, "vended service token");
                        }
                        Ok((token.to_string(), vend.ttl()))
                    }
                    None => Err(EngineError::parse_failure(
                        "vend_token",
                        "response with a token field",
                        "",
                        serde::de::Error::custom("vend response carried no token"),
                    )),
                }
            })
            .await
    }

    /// Handle a failed submission.
    ///
    /// `Ok(Some(job_id))` means the job is live despite the error (timeout
    /// recovery, or a successful resubmit after one token refresh).
    /// `Ok(None)` means the original error stands.
    async fn recover_submit(
        &self,
        session: &mut WorkflowSession,
        url: &str,
        client_request_id: &str,
        service_token: &mut String,
        error: &EngineError,
    ) -> Result<Option<String>, EngineError> {
        // The engine may accept a job yet time out on the response; it
        // often echoes the accepted jobId inside the error body.
        if error.is_timeout() {
            if let Some(job_id) = error
                .api_error()
                .and_then(|api| recover_job_id(&api.response_body))
            {
                tracing::info!(job_id, "recovered job id from submit timeout, polling anyway");
                return Ok(Some(job_id));
            }
            return Ok(None);
        }

        if let EngineError::Authentication(api) = error {
            self.tokens.clear_token().await;
            if api.error_code.as_deref() == Some("token_expired") {
                // The engine told us exactly what is wrong; a blind retry
                // with a fresh token keeps failing until credit is vended
                tracing::warn!("service token expired mid-session");
                return Ok(None);
            }
            tracing::info!("submit rejected with 401, refreshing token once");
            session.refreshed_token = true;
            *service_token = self.vend_service_token().await?;
            let submit = self
                .api
                .submit(url, service_token, client_request_id)
                .await?;
            return Ok(Some(submit.job_id));
        }

        Ok(None)
    }

    async fn poll(
        &self,
        session: &mut WorkflowSession,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
        cancel: &CancellationToken,
        url: &str,
        job_id: &str,
        mut service_token: String,
    ) -> WorkflowOutcome {
        session.advance(Stage::Polling);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let max_attempts = self.config.max_poll_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return self.fail(
                    session,
                    events,
                    FailureCategory::Cancelled,
                    "cancelled while polling".to_string(),
                );
            }
            session.poll_attempt = attempt;

            let status = match self.api.job_status(job_id, &service_token).await {
                Ok(status) => status,
                Err(EngineError::Authentication(_)) if !session.refreshed_token => {
                    session.refreshed_token = true;
                    self.tokens.clear_token().await;
                    match self.vend_service_token().await {
                        Ok(token) => {
                            service_token = token;
                            continue;
                        }
                        Err(error) => {
                            return self.fail_with_error(session, events, url, error)
                        }
                    }
                }
                Err(error) => return self.fail_with_error(session, events, url, error),
            };

            events
                .send(WorkflowEvent {
                    stage: Stage::Polling,
                    message: format!("job {} {}", job_id, status.status),
                    poll: Some(PollUpdate {
                        attempt,
                        max_attempts,
                        status: status.status.clone(),
                        progress: status.progress,
                    }),
                })
                .ok();
            session.last_status = Some(status.status.clone());

            if status.is_completed() {
                return match status.into_result() {
                    Some(result) => {
                        session.advance(Stage::Completed);
                        emit(events, Stage::Completed, "transcription complete");
                        WorkflowOutcome::Completed(result)
                    }
                    None => self.fail(
                        session,
                        events,
                        FailureCategory::JobFailed,
                        "job completed without a transcript".to_string(),
                    ),
                };
            }
            if status.is_failed() {
                let message = status
                    .error
                    .unwrap_or_else(|| "transcription job failed".to_string());
                return self.fail(session, events, FailureCategory::JobFailed, message);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.fail(
                        session,
                        events,
                        FailureCategory::Cancelled,
                        "cancelled while polling".to_string(),
                    );
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        // The remote job may still be running, which is why this is not FAILED
        session.advance(Stage::Timeout);
        emit(events, Stage::Timeout, "gave up waiting for the job to finish");
        WorkflowOutcome::TimedOut { job_id: job_id.to_string(), attempts: max_attempts }
    }

    fn fail(
        &self,
        session: &mut WorkflowSession,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
        category: FailureCategory,
        message: String,
    ) -> WorkflowOutcome {
        session.advance(Stage::Failed);
        events
            .send(WorkflowEvent {
                stage: Stage::Failed,
                message: format!("{}: {}", category, message),
                poll: None,
            })
            .ok();
        WorkflowOutcome::Failed { category, message }
    }

    /// Map an engine error to a user-facing failure, caching terminal ones
    /// so an immediate identical request short-circuits.
    fn fail_with_error(
        &self,
        session: &mut WorkflowSession,
        events: &mpsc::UnboundedSender<WorkflowEvent>,
        url: &str,
        error: EngineError,
    ) -> WorkflowOutcome {
        self.errors.cache_error(url, &error);
        let category = categorize(&error);
        tracing::warn!(%error, %category, url, "workflow failed");
        self.fail(session, events, category, error.to_string())
    }
}

fn emit(events: &mpsc::UnboundedSender<WorkflowEvent>, stage: Stage, message: &str) {
    events
        .send(WorkflowEvent { stage, message: message.to_string(), poll: None })
        .ok();
}

/// Replay the category a memoized failure had when it was first seen.
/// Entries without structured detail come from schema mismatches, which
/// [`categorize`] treats as service trouble.
fn categorize_cached(cached: &crate::resilience::CachedError) -> FailureCategory {
    match cached.detail.as_ref() {
        Some(api) if api.status == 401 => FailureCategory::AuthenticationFailed,
        Some(api) if api.status == 402 => FailureCategory::InsufficientCredits,
        Some(_) => FailureCategory::InvalidRequest,
        None => FailureCategory::ServiceUnavailable,
    }
}

fn categorize(error: &EngineError) -> FailureCategory {
    match error {
        EngineError::Authentication(_) => FailureCategory::AuthenticationFailed,
        EngineError::RateLimited(..) | EngineError::Throttled { .. } => {
            FailureCategory::RateLimited
        }
        EngineError::Client(api) if api.status == 402 => FailureCategory::InsufficientCredits,
        EngineError::Client(_) => FailureCategory::InvalidRequest,
        EngineError::Network { .. }
        | EngineError::Server(_)
        | EngineError::Parse { .. }
        | EngineError::CircuitOpen { .. } => FailureCategory::ServiceUnavailable,
    }
}

/// Pull a job id out of an error body: proper JSON first, then a raw scan
/// for a quoted `jobId` value.
fn recover_job_id(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["jobId", "job_id", "id"] {
            if let Some(id) = value.get(key).and_then(|v| v.as_str()) {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
    }

    let start = body.find("\"jobId\"")?;
    let rest = &body[start + "\"jobId\"".len()..];
    let open = rest.find('"')?;
    let rest = &rest[open + 1..];
    let close = rest.find('"')?;
    let id = &rest[..close];
    (!id.is_empty()).then(|| id.to_string())
}
