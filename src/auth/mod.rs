//! Credential resolution and token lifecycle.
//!
//! Request flow: [`classifier`] shapes the raw bearer string, [`cache`]
//! short-circuits repeat credentials, [`local`] verifies self-issued tokens,
//! [`refresh`] coalesces Google token refreshes, and [`resolver`] ties the
//! pieces together into one entry point.

pub mod cache;
pub mod classifier;
pub mod local;
pub mod refresh;
pub mod resolver;

pub use cache::SessionCache;
pub use classifier::{CredentialKind, classify};
pub use local::{Claims, LocalTokenValidator};
pub use refresh::RefreshOrchestrator;
pub use resolver::CredentialResolver;
