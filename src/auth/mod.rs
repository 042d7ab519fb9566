use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub mod token_cache;

pub use token_cache::ServiceTokenCache;

type HmacSha256 = Hmac<Sha256>;

/// Scope the engine requires for transcription calls
const TRANSCRIBE_SCOPE: &str = "ttt:transcribe";

/// Credential lifetime mandated by the engine contract
const CREDENTIAL_TTL_SECS: i64 = 900;

/// A short-lived signed bearer credential identifying the local user.
///
/// Generated fresh for each request and never persisted.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub subject: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Compact `header.payload.signature` form
    pub compact: String,
}

/// Builds HS256-signed user credentials for the Business Engine.
///
/// Pure aside from the clock: the same (user, secret, instant) always yields
/// the same token. Relies on accurate system time; there is deliberately no
/// clock-skew fudge factor.
#[derive(Debug, Clone)]
pub struct CredentialGenerator {
    secret: String,
}

impl CredentialGenerator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Generate a credential for `user_id`, valid for 15 minutes.
    pub fn generate(&self, user_id: &str) -> AuthToken {
        let issued_at = Utc::now();
        let expires_at = issued_at + ChronoDuration::seconds(CREDENTIAL_TTL_SECS);

        let header = r#"{"alg":"HS256","typ":"JWT"}"#;
        let payload = serde_json::json!({
            "sub": user_id,
            "scope": TRANSCRIBE_SCOPE,
            "iat": issued_at.timestamp(),
            "exp": expires_at.timestamp(),
        })
        .to_string();

        let encoded_header = URL_SAFE_NO_PAD.encode(header.as_bytes());
        let encoded_payload = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let signing_input = format!("{}.{}", encoded_header, encoded_payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&signing_input));

        AuthToken {
            subject: user_id.to_string(),
            scope: TRANSCRIBE_SCOPE.to_string(),
            issued_at,
            expires_at,
            compact: format!("{}.{}", signing_input, signature),
        }
    }

    /// Verify a compact token's signature. Format and signature only; the
    /// engine is the authority on expiry.
    pub fn verify(&self, compact: &str) -> bool {
        let mut parts = compact.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let expected = URL_SAFE_NO_PAD.encode(self.sign(&format!("{}.{}", header, payload)));
        expected == signature
    }

    fn sign(&self, input: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(input.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_three_part_compact_token() {
        let token = CredentialGenerator::new("test-secret").generate("user-1");
        assert_eq!(token.compact.split('.').count(), 3);
        assert_eq!(token.subject, "user-1");
        assert_eq!(token.scope, "ttt:transcribe");
    }

    #[test]
    fn claims_expire_in_fifteen_minutes() {
        let token = CredentialGenerator::new("test-secret").generate("user-1");
        assert_eq!((token.expires_at - token.issued_at).num_seconds(), 900);
    }

    #[test]
    fn payload_carries_expected_claims() {
        let token = CredentialGenerator::new("test-secret").generate("user-1");
        let payload_b64 = token.compact.split('.').nth(1).expect("payload part");
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).expect("valid base64url");
        let claims: serde_json::Value =
            serde_json::from_slice(&payload).expect("payload is JSON");

        assert_eq!(claims["sub"], "user-1");
        assert_eq!(claims["scope"], "ttt:transcribe");
        assert_eq!(
            claims["exp"].as_i64().expect("exp"),
            claims["iat"].as_i64().expect("iat") + 900
        );
    }

    #[test]
    fn signature_round_trips() {
        let generator = CredentialGenerator::new("test-secret");
        let token = generator.generate("user-1");
        assert!(generator.verify(&token.compact));
    }

    #[test]
    fn verify_rejects_tampered_tokens() {
        let generator = CredentialGenerator::new("test-secret");
        let token = generator.generate("user-1");

        let mut tampered = token.compact.clone();
        tampered.push('x');
        assert!(!generator.verify(&tampered));

        assert!(!CredentialGenerator::new("other-secret").verify(&token.compact));
        assert!(!generator.verify("only.two"));
    }
}
