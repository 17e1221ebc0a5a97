//! Error types for the Earth Engine auth gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
///
/// The credential-resolution variants are local to a single request and map
/// to HTTP 401; infrastructure variants map to HTTP 500 and are never
/// exposed verbatim to clients.
#[derive(Error, Debug)]
pub enum Error {
    /// No bearer credential was presented
    #[error("Missing credential")]
    MissingCredential,

    /// The bearer credential is neither a Google access token nor a
    /// structurally valid signed token
    #[error("Malformed credential")]
    MalformedCredential,

    /// Local token signature verification failed
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Local token is past its expiry
    #[error("Local token expired")]
    ExpiredLocalToken,

    /// The credential is valid but no directory record matches it
    #[error("Unknown user")]
    UnknownUser,

    /// Refresh was required but no refresh token is on record
    #[error("No refresh token on record; sign in with Google again")]
    RefreshTokenMissing,

    /// Google rejected the refresh grant; the user must re-authenticate
    #[error("Refresh grant rejected; sign in with Google again")]
    RefreshFailedPermanent,

    /// The refresh attempt failed transiently; the next request may retry
    #[error("Token refresh failed: {0}")]
    RefreshFailedTransient(String),

    /// An upstream call exceeded its timeout
    #[error("Upstream call timed out")]
    UpstreamTimeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error surfaces as at the request boundary.
    ///
    /// Credential-resolution failures are 401 regardless of whether they are
    /// permanent (re-authenticate) or retryable (re-send the request);
    /// everything else is a 500-class internal fault.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential
            | Self::MalformedCredential
            | Self::InvalidSignature
            | Self::ExpiredLocalToken
            | Self::UnknownUser
            | Self::RefreshTokenMissing
            | Self::RefreshFailedPermanent
            | Self::RefreshFailedTransient(_)
            | Self::UpstreamTimeout => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a subsequent identical request is free to retry the operation
    /// that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RefreshFailedTransient(_) | Self::UpstreamTimeout | Self::Http(_)
        )
    }
}
