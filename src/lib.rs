//! Earth Engine Auth Gateway
//!
//! A backend that lets a user prove identity (local password or federated
//! Google OAuth) and obtain short-lived authorization to invoke Google
//! Earth Engine operations.
//!
//! # Architecture
//!
//! - **Credential resolution** ([`auth`]): classify a bearer credential,
//!   validate it cheaply, cache the result, and transparently refresh an
//!   expired Google access token with per-user coalescing.
//! - **Identity directory** ([`directory`]): narrow trait over user/token
//!   persistence.
//! - **Upstream authority** ([`google`]): refresh-token exchange and
//!   access-token introspection against Google's OAuth endpoints.
//! - **HTTP surface** ([`server`]): account routes, authenticated API
//!   routes, health.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod directory;
pub mod earthengine;
pub mod error;
pub mod google;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
