//! Credential classification — raw bearer string to credential kind.
//!
//! Runs on every request before any validation, so it is pure and
//! allocation-free: a prefix check for Google's opaque tokens and a
//! structural three-segment scan for local signed tokens.

/// Prefix Google puts on OAuth2 opaque access tokens
pub const GOOGLE_TOKEN_PREFIX: &str = "ya29.";

/// What kind of bearer credential a request carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// A self-issued HS256 signed token
    LocalJwt,
    /// A Google-issued opaque access token
    UpstreamAccessToken,
    /// Empty or structurally unrecognizable
    Malformed,
}

/// Classify a raw bearer string by shape alone.
///
/// No validation happens here; a `LocalJwt` result only means the string
/// has the right structure to be handed to the validator.
#[must_use]
pub fn classify(raw: &str) -> CredentialKind {
    if raw.is_empty() {
        return CredentialKind::Malformed;
    }
    if raw.starts_with(GOOGLE_TOKEN_PREFIX) {
        return CredentialKind::UpstreamAccessToken;
    }
    if looks_like_jwt(raw) {
        CredentialKind::LocalJwt
    } else {
        CredentialKind::Malformed
    }
}

/// Structural check: exactly three non-empty base64url segments
fn looks_like_jwt(raw: &str) -> bool {
    let mut parts = raw.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => {
            is_base64url(header) && is_base64url(payload) && is_base64url(signature)
        }
        _ => false,
    }
}

fn is_base64url(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
}
