//! Earth Engine REST client.
//!
//! The downstream API is an opaque authorized call from this service's point
//! of view: requests carry the caller's resolved Google access token, and the
//! response JSON is relayed without interpretation.

use serde_json::Value;
use tracing::{debug, info};

use crate::config::EarthEngineConfig;
use crate::{Error, Result};

/// Client for the Earth Engine REST API.
///
/// Construct with [`EarthEngineClient::initialize`], which performs a
/// readiness probe; a client in hand is a client that was reachable at
/// startup.
pub struct EarthEngineClient {
    http: reqwest::Client,
    base_url: String,
}

impl EarthEngineClient {
    /// Build a client without probing. Used directly only where reachability
    /// is established elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &EarthEngineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Probe the API base URL and return a ready client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the base URL
    /// does not answer.
    pub async fn initialize(config: &EarthEngineConfig) -> Result<Self> {
        let client = Self::new(config)?;

        // Any HTTP answer proves reachability; auth failures are expected
        // here since the probe carries no token
        let response = client.http.get(&client.base_url).send().await?;
        debug!(status = %response.status(), "Earth Engine readiness probe answered");

        info!(base_url = %client.base_url, "Earth Engine client ready");
        Ok(client)
    }

    /// Execute a query on behalf of the caller, authorized by their Google
    /// access token. The body is relayed verbatim both ways.
    ///
    /// # Errors
    ///
    /// [`Error::UpstreamTimeout`] when the bounded timeout elapses; other
    /// transport failures surface as [`Error::Http`]; a non-2xx answer with
    /// a JSON body is relayed as [`Error::Internal`] carrying the status.
    pub async fn query(&self, access_token: &str, body: Value) -> Result<Value> {
        let url = format!("{}/projects/earthengine-public:query", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::UpstreamTimeout
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "Earth Engine returned HTTP {status}: {detail}"
            )));
        }

        response.json().await.map_err(Error::Http)
    }
}
