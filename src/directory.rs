//! Identity directory — persistent store of users and their Google tokens.
//!
//! The [`IdentityDirectory`] trait is the narrow interface the resolver and
//! refresh orchestrator consume; relational persistence lives behind it and
//! is out of scope here. The only bundled implementation is
//! [`InMemoryDirectory`], backed by a `DashMap` with an atomic id counter.
//!
//! # Refresh token monotonicity
//!
//! [`IdentityDirectory::update_tokens`] must never regress a stored refresh
//! token to nothing: a refresh cycle that yields no new refresh token passes
//! `None`, which preserves the existing value. Only an explicit `Some`
//! overwrites it. Violating this silently locks users out of refresh.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::{Error, Result};

/// The authenticated principal attached to a request.
///
/// An immutable per-request snapshot; the resolver builds one from the
/// directory record that matched the presented credential.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    /// Directory user id
    pub user_id: i64,
    /// Account email
    pub email: String,
    /// Google account id, if the account is linked
    pub provider_id: Option<String>,
    /// Current Google access token, if any
    pub access_token: Option<String>,
    /// Stored Google refresh token, if any
    pub refresh_token: Option<String>,
}

/// Data for creating a new directory record
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    /// Account email
    pub email: String,
    /// Google account id
    pub provider_id: Option<String>,
    /// Argon2 hash for local password accounts
    pub password_hash: Option<String>,
    /// Google access token observed at creation
    pub access_token: Option<String>,
    /// Google refresh token observed at creation
    pub refresh_token: Option<String>,
}

/// Persisted user record, owned by the directory
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Directory user id
    pub user_id: i64,
    /// Account email
    pub email: String,
    /// Google account id, if linked
    pub provider_id: Option<String>,
    /// Argon2 hash for local password accounts
    pub password_hash: Option<String>,
    /// Current Google access token
    pub access_token: Option<String>,
    /// Stored Google refresh token
    pub refresh_token: Option<String>,
    /// Last token-field update
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Snapshot this record as a request-scoped [`Identity`]
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id,
            email: self.email.clone(),
            provider_id: self.provider_id.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

/// Trait abstracting user/token storage.
///
/// Implementations must be `Send + Sync` because the directory is shared
/// across request tasks. All writes are single-record updates; no
/// cross-record transactions are required.
#[async_trait]
pub trait IdentityDirectory: Send + Sync + 'static {
    /// Look up a user by directory id
    async fn find_by_id(&self, user_id: i64) -> Option<UserRecord>;

    /// Look up a user by Google account id
    async fn find_by_provider_id(&self, provider_id: &str) -> Option<UserRecord>;

    /// Look up a user by email
    async fn find_by_email(&self, email: &str) -> Option<UserRecord>;

    /// Look up a user by their currently stored Google access token.
    ///
    /// Used to recover the principal when an opaque bearer token fails
    /// introspection but matches a token we previously persisted.
    async fn find_by_access_token(&self, access_token: &str) -> Option<UserRecord>;

    /// Create a new record. Fails if the email is already registered.
    async fn create(&self, new: NewIdentity) -> Result<UserRecord>;

    /// Update token fields for the user with the given Google account id.
    ///
    /// `refresh_token = None` preserves the stored refresh token; only
    /// `Some` overwrites it. Returns the updated record.
    async fn update_tokens(
        &self,
        provider_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<UserRecord>;
}

/// In-memory directory backed by a `DashMap` keyed by user id
pub struct InMemoryDirectory {
    users: DashMap<i64, UserRecord>,
    next_id: AtomicI64,
}

impl InMemoryDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryDirectory {
    async fn find_by_id(&self, user_id: i64) -> Option<UserRecord> {
        self.users.get(&user_id).map(|r| r.clone())
    }

    async fn find_by_provider_id(&self, provider_id: &str) -> Option<UserRecord> {
        self.users
            .iter()
            .find(|r| r.provider_id.as_deref() == Some(provider_id))
            .map(|r| r.clone())
    }

    async fn find_by_email(&self, email: &str) -> Option<UserRecord> {
        self.users
            .iter()
            .find(|r| r.email == email)
            .map(|r| r.clone())
    }

    async fn find_by_access_token(&self, access_token: &str) -> Option<UserRecord> {
        self.users
            .iter()
            .find(|r| r.access_token.as_deref() == Some(access_token))
            .map(|r| r.clone())
    }

    async fn create(&self, new: NewIdentity) -> Result<UserRecord> {
        if self.find_by_email(&new.email).await.is_some() {
            return Err(Error::Internal(format!(
                "email already registered: {}",
                new.email
            )));
        }

        let user_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = UserRecord {
            user_id,
            email: new.email,
            provider_id: new.provider_id,
            password_hash: new.password_hash,
            access_token: new.access_token,
            refresh_token: new.refresh_token,
            updated_at: Utc::now(),
        };
        self.users.insert(user_id, record.clone());
        Ok(record)
    }

    async fn update_tokens(
        &self,
        provider_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<UserRecord> {
        let user_id = self
            .find_by_provider_id(provider_id)
            .await
            .map(|r| r.user_id)
            .ok_or(Error::UnknownUser)?;

        let mut entry = self
            .users
            .get_mut(&user_id)
            .ok_or(Error::UnknownUser)?;

        entry.access_token = Some(access_token.to_string());
        // COALESCE semantics: only a non-null replacement overwrites
        if let Some(rt) = refresh_token {
            entry.refresh_token = Some(rt.to_string());
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}
