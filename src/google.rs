//! Google OAuth upstream — refresh-token exchange and token introspection.
//!
//! The [`UpstreamAuthority`] trait is the seam between the credential
//! subsystem and Google's endpoints; [`GoogleTokenClient`] is the production
//! implementation, tests substitute mocks that count invocations.
//!
//! Error classification matters more than the calls themselves:
//! `invalid_grant` means the refresh token is dead and the user must
//! re-authenticate (permanent); a timeout or 5xx is transient and the next
//! request may retry. The distinction is carried in [`UpstreamError`] so the
//! refresh orchestrator never retries a revoked grant.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GoogleConfig;
use crate::{Error, Result};

/// Normalized result of a refresh-token exchange.
///
/// Google sometimes omits `refresh_token` from the response; the option is
/// preserved so the directory can keep the stored one.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// The new access token
    pub access_token: String,
    /// Replacement refresh token, if Google rotated it
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires
    pub expires_in: Option<u64>,
}

/// Principal information learned from introspecting an opaque access token
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    /// Google's stable account id (`sub`)
    pub provider_id: String,
    /// Account email
    pub email: String,
}

/// Upstream failure classification.
///
/// `Clone` because a coalesced refresh shares one outcome among all waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// The refresh grant was revoked or is otherwise permanently unusable
    #[error("refresh grant rejected: {0}")]
    GrantRevoked(String),

    /// The presented access token is invalid or expired
    #[error("access token invalid or expired")]
    InvalidToken,

    /// The call exceeded its bounded timeout
    #[error("upstream call timed out")]
    Timeout,

    /// Network failure or 5xx; safe to retry on a later request
    #[error("transient upstream failure: {0}")]
    Transient(String),
}

/// Trait abstracting the Google token and introspection endpoints
#[async_trait]
pub trait UpstreamAuthority: Send + Sync + 'static {
    /// Exchange an authorization code (from the consent callback) for the
    /// initial token pair. Offline consent yields a refresh token here and
    /// usually nowhere else.
    async fn exchange_code(&self, code: &str)
    -> std::result::Result<TokenGrant, UpstreamError>;

    /// Exchange a refresh token for a new access token
    async fn refresh(&self, refresh_token: &str)
    -> std::result::Result<TokenGrant, UpstreamError>;

    /// Validate an opaque access token and learn the principal it represents
    async fn introspect(
        &self,
        access_token: &str,
    ) -> std::result::Result<TokenIdentity, UpstreamError>;
}

/// Wire shape of Google's token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Wire shape of Google's token error responses
#[derive(Debug, Deserialize, Default)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Wire shape of Google's tokeninfo response
#[derive(Debug, Deserialize)]
struct TokenInfoResponse {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Production client for Google's OAuth endpoints.
///
/// Explicitly constructed and injected; there is no module-level client
/// state. The HTTP client carries the bounded timeout from config, so no
/// call can wait indefinitely.
pub struct GoogleTokenClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    tokeninfo_endpoint: String,
    redirect_uri: String,
}

impl GoogleTokenClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &GoogleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            client_id: config.resolve_client_id(),
            client_secret: config.resolve_client_secret(),
            token_endpoint: config.token_endpoint.clone(),
            tokeninfo_endpoint: config.tokeninfo_endpoint.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    /// POST a grant request to the token endpoint and normalize the response
    async fn request_grant(
        &self,
        params: &HashMap<&str, &str>,
    ) -> std::result::Result<TokenGrant, UpstreamError> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token grant rejected");
            return Err(classify_grant_rejection(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Transient(format!("bad token response: {e}")))?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl UpstreamAuthority for GoogleTokenClient {
    async fn exchange_code(
        &self,
        code: &str,
    ) -> std::result::Result<TokenGrant, UpstreamError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        params.insert("redirect_uri", self.redirect_uri.as_str());

        let grant = self.request_grant(&params).await?;
        debug!(got_refresh = grant.refresh_token.is_some(), "Authorization code exchanged");
        Ok(grant)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, UpstreamError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());

        let grant = self.request_grant(&params).await?;
        debug!(rotated_refresh = grant.refresh_token.is_some(), "Token refresh succeeded");
        Ok(grant)
    }

    async fn introspect(
        &self,
        access_token: &str,
    ) -> std::result::Result<TokenIdentity, UpstreamError> {
        let response = self
            .http
            .get(&self.tokeninfo_endpoint)
            .query(&[("access_token", access_token)])
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_client_error() {
            // Google answers 400 for expired/revoked/garbage tokens alike
            debug!(status = %status, "Introspection reported invalid token");
            return Err(UpstreamError::InvalidToken);
        }
        if !status.is_success() {
            return Err(UpstreamError::Transient(format!(
                "tokeninfo returned HTTP {status}"
            )));
        }

        let info: TokenInfoResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Transient(format!("bad tokeninfo response: {e}")))?;

        Ok(TokenIdentity {
            provider_id: info.sub,
            email: info.email.unwrap_or_default(),
        })
    }
}

/// Map a reqwest transport error to timeout vs transient
fn classify_request_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transient(e.to_string())
    }
}

/// Classify a non-2xx token-endpoint response body.
///
/// `invalid_grant` covers both a revoked/expired refresh token and a spent
/// authorization code; it is the only permanent rejection. Everything else
/// is treated as retryable.
fn classify_grant_rejection(status: StatusCode, body: &str) -> UpstreamError {
    let parsed: TokenErrorResponse = serde_json::from_str(body).unwrap_or_default();
    if parsed.error == "invalid_grant" {
        let detail = parsed
            .error_description
            .unwrap_or_else(|| "invalid_grant".to_string());
        UpstreamError::GrantRevoked(detail)
    } else {
        UpstreamError::Transient(format!("token endpoint returned HTTP {status}"))
    }
}
