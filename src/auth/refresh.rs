//! Refresh orchestration — demand-driven access-token refresh with
//! per-user coalescing.
//!
//! When a principal's Google access token is absent or expired, exactly one
//! upstream refresh call runs per user at a time. The first request for a
//! user becomes the leader and spawns the exchange; concurrent requests for
//! the same user find the in-flight marker and await the leader's outcome
//! instead of issuing their own call. The marker is removed on completion,
//! success or failure.
//!
//! The exchange runs in a spawned task so an abandoned request cannot
//! cancel it mid-flight; its result still benefits the other waiters.
//!
//! There is no background retry: a transient failure is surfaced to the
//! caller and the *next* request re-enters the refresh path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::cache::SessionCache;
use crate::directory::{Identity, IdentityDirectory, UserRecord};
use crate::google::{UpstreamAuthority, UpstreamError};
use crate::{Error, Result};

/// Shared outcome of one refresh attempt.
///
/// `Clone` so the leader's result can fan out to every coalesced waiter.
type RefreshOutcome = std::result::Result<Identity, RefreshFailure>;

/// Cloneable failure classification carried through the in-flight channel
#[derive(Debug, Clone)]
enum RefreshFailure {
    /// Grant revoked; user must re-authenticate
    Permanent,
    /// Retryable on the next request
    Transient(String),
    /// Upstream timeout
    Timeout,
    /// Directory or invariant fault
    Internal(String),
}

impl From<RefreshFailure> for Error {
    fn from(f: RefreshFailure) -> Self {
        match f {
            RefreshFailure::Permanent => Error::RefreshFailedPermanent,
            RefreshFailure::Transient(msg) => Error::RefreshFailedTransient(msg),
            RefreshFailure::Timeout => Error::UpstreamTimeout,
            RefreshFailure::Internal(msg) => Error::Internal(msg),
        }
    }
}

/// Coordinates access-token refresh across concurrent requests
pub struct RefreshOrchestrator {
    upstream: Arc<dyn UpstreamAuthority>,
    directory: Arc<dyn IdentityDirectory>,
    cache: Arc<SessionCache>,
    /// TTL for the cache entry written under the refreshed access token
    access_token_ttl: Duration,
    /// In-flight refresh registry, keyed by user id
    in_flight: DashMap<i64, watch::Receiver<Option<RefreshOutcome>>>,
}

impl RefreshOrchestrator {
    /// Create an orchestrator over the given collaborators
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamAuthority>,
        directory: Arc<dyn IdentityDirectory>,
        cache: Arc<SessionCache>,
        access_token_ttl: Duration,
    ) -> Self {
        Self {
            upstream,
            directory,
            cache,
            access_token_ttl,
            in_flight: DashMap::new(),
        }
    }

    /// Refresh the principal's access token, coalescing with any refresh
    /// already in flight for the same user.
    ///
    /// # Errors
    ///
    /// [`Error::RefreshTokenMissing`] if no refresh token is stored;
    /// [`Error::RefreshFailedPermanent`] if the grant was revoked;
    /// [`Error::RefreshFailedTransient`] / [`Error::UpstreamTimeout`] for
    /// retryable upstream failures.
    pub async fn refresh(self: &Arc<Self>, user: &UserRecord) -> Result<Identity> {
        // Precondition: never attempt a refresh without a stored token
        let Some(refresh_token) = user.refresh_token.clone() else {
            warn!(user_id = user.user_id, "Refresh needed but no refresh token stored");
            return Err(Error::RefreshTokenMissing);
        };

        let mut rx = match self.in_flight.entry(user.user_id) {
            Entry::Occupied(existing) => {
                debug!(user_id = user.user_id, "Awaiting in-flight refresh");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());

                let this = Arc::clone(self);
                let record = user.clone();
                tokio::spawn(async move {
                    let outcome = this.perform_refresh(&record, &refresh_token).await;
                    // Marker cleared before waiters observe the outcome, so
                    // a follow-up request starts a new cycle rather than
                    // subscribing to a finished one.
                    this.in_flight.remove(&record.user_id);
                    let _ = tx.send(Some(outcome));
                });
                rx
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::RefreshFailedTransient("refresh task dropped".to_string()))?
            .clone()
            .ok_or_else(|| Error::Internal("empty refresh outcome".to_string()))?;

        outcome.map_err(Error::from)
    }

    /// One upstream exchange plus persistence and cache write
    async fn perform_refresh(&self, user: &UserRecord, refresh_token: &str) -> RefreshOutcome {
        let grant = match self.upstream.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(UpstreamError::GrantRevoked(detail)) => {
                warn!(user_id = user.user_id, detail = %detail, "Refresh grant revoked");
                return Err(RefreshFailure::Permanent);
            }
            Err(UpstreamError::Timeout) => {
                warn!(user_id = user.user_id, "Refresh timed out");
                return Err(RefreshFailure::Timeout);
            }
            Err(e) => {
                warn!(user_id = user.user_id, error = %e, "Refresh failed transiently");
                return Err(RefreshFailure::Transient(e.to_string()));
            }
        };

        let Some(provider_id) = user.provider_id.as_deref() else {
            return Err(RefreshFailure::Internal(
                "refresh for account without provider link".to_string(),
            ));
        };

        // Monotonic refresh token: None preserves the stored value
        let updated = self
            .directory
            .update_tokens(provider_id, &grant.access_token, grant.refresh_token.as_deref())
            .await
            .map_err(|e| RefreshFailure::Internal(e.to_string()))?;

        let identity = updated.identity();
        // Fresh entry keyed by the NEW access token; the old key is left
        // to expire naturally.
        self.cache
            .insert(&grant.access_token, identity.clone(), self.access_token_ttl);

        info!(user_id = user.user_id, "Access token refreshed");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::directory::{InMemoryDirectory, NewIdentity};
    use crate::google::{TokenGrant, TokenIdentity};

    /// Mock upstream that counts refresh invocations and serves a scripted
    /// response after an optional delay.
    struct MockUpstream {
        refresh_calls: AtomicUsize,
        delay: Duration,
        response: std::result::Result<TokenGrant, UpstreamError>,
    }

    impl MockUpstream {
        fn grant(access_token: &str, refresh_token: Option<&str>) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
                response: Ok(TokenGrant {
                    access_token: access_token.to_string(),
                    refresh_token: refresh_token.map(ToString::to_string),
                    expires_in: Some(3600),
                }),
            }
        }

        fn failure(err: UpstreamError) -> Self {
            Self {
                refresh_calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                response: Err(err),
            }
        }
    }

    #[async_trait]
    impl UpstreamAuthority for MockUpstream {
        async fn exchange_code(
            &self,
            _code: &str,
        ) -> std::result::Result<TokenGrant, UpstreamError> {
            unimplemented!("not used by refresh tests")
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<TokenGrant, UpstreamError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }

        async fn introspect(
            &self,
            _access_token: &str,
        ) -> std::result::Result<TokenIdentity, UpstreamError> {
            unimplemented!("not used by refresh tests")
        }
    }

    async fn seeded_directory() -> Arc<InMemoryDirectory> {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.create(NewIdentity {
            email: "alice@example.com".to_string(),
            provider_id: Some("g-alice".to_string()),
            access_token: None,
            refresh_token: Some("valid-refresh".to_string()),
            ..NewIdentity::default()
        })
        .await
        .unwrap();
        dir
    }

    fn orchestrator(
        upstream: Arc<MockUpstream>,
        directory: Arc<InMemoryDirectory>,
    ) -> Arc<RefreshOrchestrator> {
        Arc::new(RefreshOrchestrator::new(
            upstream,
            directory,
            Arc::new(SessionCache::new()),
            Duration::from_secs(3480),
        ))
    }

    #[tokio::test]
    async fn refresh_persists_and_caches_under_new_token() {
        let upstream = Arc::new(MockUpstream::grant("ya29.new-token", None));
        let directory = seeded_directory().await;
        let cache = Arc::new(SessionCache::new());
        let orch = Arc::new(RefreshOrchestrator::new(
            upstream.clone(),
            directory.clone(),
            cache.clone(),
            Duration::from_secs(3480),
        ));
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        let identity = orch.refresh(&user).await.unwrap();

        assert_eq!(identity.access_token.as_deref(), Some("ya29.new-token"));
        // Refresh token preserved (upstream returned none)
        assert_eq!(identity.refresh_token.as_deref(), Some("valid-refresh"));
        // New cache entry keyed by the new access token
        assert_eq!(cache.get("ya29.new-token").unwrap().user_id, identity.user_id);
        // Persisted
        let stored = directory.find_by_provider_id("g-alice").await.unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("ya29.new-token"));
    }

    #[tokio::test]
    async fn rotated_refresh_token_overwrites_stored_one() {
        let upstream = Arc::new(MockUpstream::grant("ya29.new", Some("rotated-refresh")));
        let directory = seeded_directory().await;
        let orch = orchestrator(upstream, directory.clone());
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        orch.refresh(&user).await.unwrap();

        let stored = directory.find_by_provider_id("g-alice").await.unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated-refresh"));
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_to_one_upstream_call() {
        let upstream = Arc::new(MockUpstream::grant("ya29.coalesced", None));
        let directory = seeded_directory().await;
        let orch = orchestrator(upstream.clone(), directory.clone());
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let user = user.clone();
                tokio::spawn(async move { orch.refresh(&user).await })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        for result in results {
            let identity = result.unwrap().unwrap();
            assert_eq!(identity.access_token.as_deref(), Some("ya29.coalesced"));
        }

        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 1);
        // Marker cleared after completion
        assert!(orch.in_flight.is_empty());
    }

    #[tokio::test]
    async fn missing_refresh_token_is_terminal_and_never_calls_upstream() {
        let upstream = Arc::new(MockUpstream::grant("ya29.unused", None));
        let directory = Arc::new(InMemoryDirectory::new());
        let user = directory
            .create(NewIdentity {
                email: "bob@example.com".to_string(),
                provider_id: Some("g-bob".to_string()),
                ..NewIdentity::default()
            })
            .await
            .unwrap();
        let orch = orchestrator(upstream.clone(), directory);

        let err = orch.refresh(&user).await.unwrap_err();

        assert!(matches!(err, Error::RefreshTokenMissing));
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoked_grant_is_permanent() {
        let upstream = Arc::new(MockUpstream::failure(UpstreamError::GrantRevoked(
            "Token has been revoked.".to_string(),
        )));
        let directory = seeded_directory().await;
        let orch = orchestrator(upstream, directory.clone());
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        let err = orch.refresh(&user).await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailedPermanent));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_is_transient_and_next_attempt_reenters() {
        let upstream = Arc::new(MockUpstream::failure(UpstreamError::Timeout));
        let directory = seeded_directory().await;
        let orch = orchestrator(upstream.clone(), directory.clone());
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        let err = orch.refresh(&user).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamTimeout));
        assert!(err.is_retryable());

        // The marker is gone, so the next request issues a fresh call
        let err = orch.refresh(&user).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamTimeout));
        assert_eq!(upstream.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_does_not_touch_stored_tokens() {
        let upstream = Arc::new(MockUpstream::failure(UpstreamError::Transient(
            "503".to_string(),
        )));
        let directory = seeded_directory().await;
        let orch = orchestrator(upstream, directory.clone());
        let user = directory.find_by_provider_id("g-alice").await.unwrap();

        let _ = orch.refresh(&user).await;

        let stored = directory.find_by_provider_id("g-alice").await.unwrap();
        assert_eq!(stored.access_token, None);
        assert_eq!(stored.refresh_token.as_deref(), Some("valid-refresh"));
    }
}
