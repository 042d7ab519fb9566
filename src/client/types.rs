//! Wire types for the Business Engine API.
//!
//! Unknown fields are ignored on deserialize so the client keeps working
//! when the backend adds fields. Fields the backend has renamed across
//! versions carry aliases and a single accessor that normalizes them.

use serde::{Deserialize, Serialize};

/// `GET /health`
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok") || self.status.eq_ignore_ascii_case("healthy")
    }
}

/// `GET /v1/credits/balance`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    #[serde(default)]
    pub user_id: Option<String>,
    pub balance: i64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `POST /v1/vend-token`
///
/// The token field has gone through three names across backend releases;
/// the aliases accept them all.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendToken {
    #[serde(default, alias = "serviceToken", alias = "pollingToken")]
    pub token: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub balance_after: Option<i64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl VendToken {
    /// The vended token under whichever name the backend used.
    pub fn service_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    /// Reported lifetime in seconds, defaulting to fifteen minutes when the
    /// backend omits it.
    pub fn ttl(&self) -> u64 {
        self.ttl_seconds.or(self.expires_in).unwrap_or(900)
    }
}

/// `GET /meta?url=...`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, alias = "durationSeconds")]
    pub duration: Option<f64>,
    #[serde(default, alias = "thumbnailUrl")]
    pub thumbnail: Option<String>,
}

/// `POST /ttt/transcribe`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
}

/// Response to a submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmit {
    #[serde(alias = "id")]
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub estimated_time: Option<u64>,
}

/// `GET /ttt/status/{jobId}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default, alias = "transcription", alias = "text")]
    pub transcript: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, alias = "durationSeconds")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Older backend releases nested the payload under `result`.
    #[serde(default)]
    pub result: Option<JobResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(default, alias = "text", alias = "transcript")]
    pub transcription: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "durationSeconds")]
    pub duration: Option<f64>,
}

impl JobStatus {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed") || self.status.eq_ignore_ascii_case("done")
    }

    pub fn is_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed") || self.status.eq_ignore_ascii_case("error")
    }

    /// The transcript text, whichever field or nesting carried it.
    pub fn transcript(&self) -> Option<&str> {
        self.transcript
            .as_deref()
            .or_else(|| self.result.as_ref().and_then(|r| r.transcription.as_deref()))
            .filter(|t| !t.is_empty())
    }

    /// Convert a completed status into the final result payload.
    pub fn into_result(self) -> Option<TranscriptionResult> {
        let nested = self.result;
        let transcript = self
            .transcript
            .or_else(|| nested.as_ref().and_then(|r| r.transcription.clone()))
            .filter(|t| !t.is_empty())?;
        Some(TranscriptionResult {
            transcript,
            confidence: self.confidence.or_else(|| nested.as_ref().and_then(|r| r.confidence)),
            language: self
                .language
                .or_else(|| nested.as_ref().and_then(|r| r.language.clone())),
            duration_seconds: self
                .duration
                .or_else(|| nested.as_ref().and_then(|r| r.duration)),
        })
    }
}

/// Final output of a successful transcription workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vend_token_accepts_all_field_names() {
        for body in [
            r#"{"token": "abc", "ttlSeconds": 600}"#,
            r#"{"serviceToken": "abc", "expiresIn": 600}"#,
            r#"{"pollingToken": "abc"}"#,
        ] {
            let vend: VendToken = serde_json::from_str(body).expect("parse");
            assert_eq!(vend.service_token(), Some("abc"), "body: {body}");
        }
    }

    #[test]
    fn vend_token_ttl_defaults_to_fifteen_minutes() {
        let vend: VendToken = serde_json::from_str(r#"{"token": "abc"}"#).expect("parse");
        assert_eq!(vend.ttl(), 900);
    }

    #[test]
    fn job_status_normalizes_transcript_field() {
        let body = r#"{"status": "completed", "result": {"text": "Hello world"}}"#;
        let status: JobStatus = serde_json::from_str(body).expect("parse");
        assert!(status.is_completed());
        assert_eq!(status.transcript(), Some("Hello world"));
    }

    #[test]
    fn job_status_tolerates_unknown_fields() {
        let body = r#"{"status": "processing", "progress": 33, "queuePosition": 2}"#;
        let status: JobStatus = serde_json::from_str(body).expect("parse");
        assert!(!status.is_completed());
        assert_eq!(status.progress, Some(33));
    }

    #[test]
    fn completed_status_without_transcript_has_no_result() {
        let body = r#"{"status": "completed", "result": {"confidence": 0.9}}"#;
        let status: JobStatus = serde_json::from_str(body).expect("parse");
        assert!(status.into_result().is_none());
    }

    #[test]
    fn job_submit_accepts_id_alias() {
        let submit: JobSubmit = serde_json::from_str(r#"{"id": "job-1"}"#).expect("parse");
        assert_eq!(submit.job_id, "job-1");
    }
}
