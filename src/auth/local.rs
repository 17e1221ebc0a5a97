//! Local signed-token validation and issuance.
//!
//! Self-issued HS256 tokens against a shared secret. Both failure modes are
//! terminal for the presented credential: a bad signature or a past `exp`
//! means the caller must obtain a new token, never retry this one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Claims carried by a local token.
///
/// `sub` is always the directory user id; `provider_id` is present for
/// accounts linked to Google so the resolver can use the stable provider
/// key directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Directory user id
    pub sub: i64,
    /// Account email
    pub email: String,
    /// Google account id, if linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Issued-at (Unix epoch seconds)
    pub iat: u64,
    /// Expires-at (Unix epoch seconds)
    pub exp: u64,
}

/// Validates and issues local HS256 tokens
pub struct LocalTokenValidator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl LocalTokenValidator {
    /// Create a validator from the shared signing secret
    #[must_use]
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    /// Issue a token for the given principal
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if signing fails.
    pub fn issue(&self, user_id: i64, email: &str, provider_id: Option<&str>) -> Result<String> {
        let now = unix_now();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            provider_id: provider_id.map(ToString::to_string),
            iat: now,
            exp: now + self.lifetime.as_secs(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))
    }

    /// Verify a token's signature and expiry, returning its claims.
    ///
    /// # Errors
    ///
    /// [`Error::ExpiredLocalToken`] if `exp` has passed,
    /// [`Error::InvalidSignature`] for any other verification failure.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // No leeway: a token one second past exp is expired
        validation.leeway = 0;
        validation.validate_aud = false;

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::ExpiredLocalToken,
                _ => Error::InvalidSignature,
            })
    }
}

/// Current Unix time in seconds
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> LocalTokenValidator {
        LocalTokenValidator::new("test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issue_then_verify_roundtrips_claims() {
        let v = validator();
        let token = v.issue(42, "alice@example.com", Some("g-alice")).unwrap();

        let claims = v.verify(&token).unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.email, "alice@example.com");
        assert_eq!(claims.provider_id.as_deref(), Some("g-alice"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn issue_without_provider_id_omits_it() {
        let v = validator();
        let token = v.issue(7, "bob@example.com", None).unwrap();
        let claims = v.verify(&token).unwrap();
        assert_eq!(claims.provider_id, None);
    }

    #[test]
    fn wrong_secret_is_invalid_signature() {
        let token = validator().issue(1, "alice@example.com", None).unwrap();
        let other = LocalTokenValidator::new("different-secret", Duration::from_secs(3600));

        assert!(matches!(
            other.verify(&token),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_token_is_invalid_signature() {
        let v = validator();
        let mut token = v.issue(1, "alice@example.com", None).unwrap();
        token.push('x');

        assert!(matches!(v.verify(&token), Err(Error::InvalidSignature)));
    }

    #[test]
    fn expired_token_is_expired_local_token() {
        // Sign a token whose exp is one second in the past
        let v = validator();
        let now = unix_now();
        let claims = Claims {
            sub: 1,
            email: "alice@example.com".to_string(),
            provider_id: None,
            iat: now - 3600,
            exp: now - 1,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert!(matches!(v.verify(&token), Err(Error::ExpiredLocalToken)));
    }

    #[test]
    fn garbage_is_invalid_signature() {
        assert!(matches!(
            validator().verify("not.a.jwt"),
            Err(Error::InvalidSignature)
        ));
    }
}
