//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default configuration file looked up next to the working directory
const DEFAULT_CONFIG_FILE: &str = "earthgate.yaml";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Local credential configuration (JWT secret, TTLs)
    pub auth: AuthConfig,
    /// Google OAuth endpoints and client credentials
    pub google: GoogleConfig,
    /// Earth Engine downstream API
    pub earthengine: EarthEngineConfig,
}

impl Config {
    /// Load configuration from a YAML file (if present) layered under
    /// `EARTHGATE_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file or environment cannot be
    /// deserialized into a valid configuration.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new();

        match path {
            Some(p) => figment = figment.merge(Yaml::file(p)),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                figment = figment.merge(Yaml::file(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        figment
            .merge(Env::prefixed("EARTHGATE_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Local credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for signing local tokens.
    /// Supports a literal value or `env:VAR_NAME` indirection.
    pub jwt_secret: String,

    /// Lifetime of issued local tokens, in seconds (default 1 hour)
    pub token_lifetime_secs: u64,

    /// Session cache TTL for resolved identities, in seconds (default 1 hour)
    pub identity_ttl_secs: u64,

    /// Session cache TTL for bare Google access tokens, in seconds.
    /// Slightly shorter than the identity TTL to pre-empt upstream expiry
    /// (default 58 minutes).
    pub access_token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_lifetime_secs: 3600,
            identity_ttl_secs: 3600,
            access_token_ttl_secs: 3480,
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret (expand `env:VAR_NAME` indirection).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is empty after resolution.
    pub fn resolve_jwt_secret(&self) -> Result<String> {
        let secret = if let Some(var_name) = self.jwt_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            self.jwt_secret.clone()
        };

        if secret.is_empty() {
            return Err(Error::Config(
                "auth.jwt_secret must be set (literal or env:VAR_NAME)".to_string(),
            ));
        }
        Ok(secret)
    }

    /// Session cache TTL for resolved identities
    #[must_use]
    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }

    /// Session cache TTL for bare Google access tokens
    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    /// Lifetime of issued local tokens
    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }
}

/// Google OAuth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// OAuth client ID (supports `env:VAR_NAME`)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Consent endpoint users are redirected to for account linking
    pub auth_endpoint: String,
    /// Token endpoint for code exchange and refresh-token exchange
    pub token_endpoint: String,
    /// Introspection endpoint for opaque access tokens
    pub tokeninfo_endpoint: String,
    /// Redirect URI registered for the OAuth callback
    pub redirect_uri: String,
    /// Scopes requested at consent; Earth Engine access rides on these
    pub scopes: Vec<String>,
    /// Bounded timeout for upstream calls, in seconds
    pub timeout_secs: u64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            tokeninfo_endpoint: "https://oauth2.googleapis.com/tokeninfo".to_string(),
            redirect_uri: "http://localhost:8080/auth/google/callback".to_string(),
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
                "https://www.googleapis.com/auth/earthengine.readonly".to_string(),
                "https://www.googleapis.com/auth/devstorage.read_only".to_string(),
            ],
            timeout_secs: 10,
        }
    }
}

impl GoogleConfig {
    /// Resolve the client ID (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_env_ref(&self.client_id)
    }

    /// Resolve the client secret (expand `env:VAR_NAME`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_env_ref(&self.client_secret)
    }

    /// Upstream call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Earth Engine downstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarthEngineConfig {
    /// Base URL of the Earth Engine REST API
    pub base_url: String,
    /// Bounded timeout for queries, in seconds
    pub timeout_secs: u64,
}

impl Default for EarthEngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://earthengine.googleapis.com/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EarthEngineConfig {
    /// Query timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Expand `env:VAR_NAME` references, passing literals through
fn resolve_env_ref(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}
