//! Bearer credential verification.
//!
//! Every RPC carries an `authorization` value holding an HS256 JSON Web Token,
//! optionally prefixed with `"Bearer "`. The token must carry a valid
//! signature under the shared secret, an unexpired `exp` claim, and a
//! `user_id` claim that identifies the caller. The caller's identity is
//! returned as a [`Principal`] that lives for the duration of one call.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BEARER_PREFIX: &str = "Bearer ";

/// Reasons a credential is rejected.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was attached to the call
    #[error("authorization token is not provided")]
    Missing,
    /// Signature check or decoding failed
    #[error("invalid token: {0}")]
    Invalid(String),
    /// The `exp` claim is in the past
    #[error("token expired")]
    Expired,
    /// The `user_id` claim is absent or not a usable identifier
    #[error("invalid user id in token")]
    BadSubject,
    /// Minting a token failed
    #[error("failed to issue token: {0}")]
    Issue(String),
}

/// The authenticated caller of a single RPC.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    subject: String,
}

impl Principal {
    /// Create a principal for the given subject identifier.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    /// The canonical subject identifier, used as the owner of uploaded files.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject)
    }
}

/// `user_id` may be a JSON number or a string; both normalise to a string.
///
/// Issuers that only know doubles send `12.0`; a whole float reads as the
/// integer it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SubjectClaim {
    Numeric(i64),
    Float(f64),
    Text(String),
}

impl SubjectClaim {
    fn from_subject(subject: &str) -> Self {
        match subject.parse::<i64>() {
            Ok(n) if n.to_string() == subject => SubjectClaim::Numeric(n),
            _ => SubjectClaim::Text(subject.to_string()),
        }
    }

    fn into_subject(self) -> Option<String> {
        match self {
            SubjectClaim::Numeric(n) => Some(n.to_string()),
            SubjectClaim::Float(f)
                if f.is_finite()
                    && f.fract() == 0.0
                    && f >= i64::MIN as f64
                    && f < i64::MAX as f64 =>
            {
                Some((f as i64).to_string())
            }
            SubjectClaim::Float(_) => None,
            SubjectClaim::Text(s) if !s.trim().is_empty() => Some(s),
            SubjectClaim::Text(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<SubjectClaim>,
    exp: i64,
}

/// Verifies bearer credentials against a shared HS256 secret.
#[derive(Clone)]
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create an authenticator for the given shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a raw credential and resolve the caller.
    ///
    /// `credential` is the value of the `authorization` header, if any. A
    /// leading `"Bearer "` is stripped before verification; a scheme with no
    /// token after it counts as no credential at all.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<Principal, AuthError> {
        let token = credential
            .map(|c| c.trim_start())
            .map(|c| c.strip_prefix(BEARER_PREFIX).unwrap_or(c).trim())
            .unwrap_or_default();
        if token.is_empty() || token == BEARER_PREFIX.trim_end() {
            return Err(AuthError::Missing);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;

        let subject = data
            .claims
            .user_id
            .and_then(SubjectClaim::into_subject)
            .ok_or(AuthError::BadSubject)?;

        Ok(Principal::new(subject))
    }

    /// Mint a token for `subject` that expires after `ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs()).map_err(|e| AuthError::Issue(e.to_string()))?;
        let claims = Claims {
            user_id: Some(SubjectClaim::from_subject(subject)),
            exp: chrono::Utc::now().timestamp() + ttl,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_issued_token_round_trips() {
        let auth = Authenticator::new(SECRET);
        let token = auth.issue("42", Duration::from_secs(60)).unwrap();

        let principal = auth.authenticate(Some(&token)).unwrap();
        assert_eq!(principal.subject(), "42");
    }

    #[test]
    fn test_bearer_prefix_is_stripped() {
        let auth = Authenticator::new(SECRET);
        let token = auth.issue("7", Duration::from_secs(60)).unwrap();

        let principal = auth.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(principal.subject(), "7");
    }

    #[test]
    fn test_numeric_and_string_subjects_are_canonical_strings() {
        let auth = Authenticator::new(SECRET);

        let numeric = sign(
            &serde_json::json!({"user_id": 12, "exp": in_one_hour()}),
            SECRET,
        );
        let text = sign(
            &serde_json::json!({"user_id": "alice", "exp": in_one_hour()}),
            SECRET,
        );

        assert_eq!(auth.authenticate(Some(&numeric)).unwrap().subject(), "12");
        assert_eq!(auth.authenticate(Some(&text)).unwrap().subject(), "alice");
    }

    #[test]
    fn test_missing_credential() {
        let auth = Authenticator::new(SECRET);

        assert!(matches!(auth.authenticate(None), Err(AuthError::Missing)));
        assert!(matches!(
            auth.authenticate(Some("Bearer ")),
            Err(AuthError::Missing)
        ));
    }

    #[test]
    fn test_blank_or_bare_scheme_is_missing() {
        let auth = Authenticator::new(SECRET);

        for raw in ["", "   ", "Bearer", "Bearer    ", "  Bearer  "] {
            assert!(
                matches!(auth.authenticate(Some(raw)), Err(AuthError::Missing)),
                "{raw:?} should count as no credential"
            );
        }
    }

    #[test]
    fn test_whole_float_subject_reads_as_integer() {
        let auth = Authenticator::new(SECRET);
        let whole = sign(
            &serde_json::json!({"user_id": 12.0, "exp": in_one_hour()}),
            SECRET,
        );
        let fractional = sign(
            &serde_json::json!({"user_id": 12.5, "exp": in_one_hour()}),
            SECRET,
        );

        assert_eq!(auth.authenticate(Some(&whole)).unwrap().subject(), "12");
        assert!(matches!(
            auth.authenticate(Some(&fractional)),
            Err(AuthError::BadSubject)
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let auth = Authenticator::new(SECRET);
        let forged = sign(
            &serde_json::json!({"user_id": 1, "exp": in_one_hour()}),
            "other-secret",
        );

        assert!(matches!(
            auth.authenticate(Some(&forged)),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let auth = Authenticator::new(SECRET);
        let expired = sign(
            &serde_json::json!({"user_id": 1, "exp": chrono::Utc::now().timestamp() - 10}),
            SECRET,
        );

        assert!(matches!(
            auth.authenticate(Some(&expired)),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_token_without_expiry_is_rejected() {
        let auth = Authenticator::new(SECRET);
        let token = sign(&serde_json::json!({"user_id": 1}), SECRET);

        assert!(matches!(
            auth.authenticate(Some(&token)),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_or_empty_subject_is_rejected() {
        let auth = Authenticator::new(SECRET);
        let missing = sign(&serde_json::json!({"exp": in_one_hour()}), SECRET);
        let empty = sign(
            &serde_json::json!({"user_id": " ", "exp": in_one_hour()}),
            SECRET,
        );

        assert!(matches!(
            auth.authenticate(Some(&missing)),
            Err(AuthError::BadSubject)
        ));
        assert!(matches!(
            auth.authenticate(Some(&empty)),
            Err(AuthError::BadSubject)
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let auth = Authenticator::new(SECRET);
        assert!(matches!(
            auth.authenticate(Some("not-a-jwt")),
            Err(AuthError::Invalid(_))
        ));
    }
}
