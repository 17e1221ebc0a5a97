//! Credential resolution — raw bearer string to authenticated identity.
//!
//! The single entry point every protected request flows through. Order is
//! fixed: session cache first, then classification, then the kind-specific
//! path (local validation or upstream introspection), with refresh invoked
//! on demand. Only successful resolutions are cached; failures are
//! re-evaluated on every request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::auth::cache::SessionCache;
use crate::auth::classifier::{self, CredentialKind};
use crate::auth::local::LocalTokenValidator;
use crate::auth::refresh::RefreshOrchestrator;
use crate::directory::{Identity, IdentityDirectory, NewIdentity, UserRecord};
use crate::google::{UpstreamAuthority, UpstreamError};
use crate::{Error, Result};

/// Resolves bearer credentials to identities
pub struct CredentialResolver {
    validator: LocalTokenValidator,
    directory: Arc<dyn IdentityDirectory>,
    upstream: Arc<dyn UpstreamAuthority>,
    cache: Arc<SessionCache>,
    refresh: Arc<RefreshOrchestrator>,
    /// Cache TTL for identities resolved from local tokens
    identity_ttl: Duration,
    /// Cache TTL for identities resolved from Google access tokens
    access_token_ttl: Duration,
}

impl CredentialResolver {
    /// Assemble a resolver from its collaborators
    #[must_use]
    pub fn new(
        validator: LocalTokenValidator,
        directory: Arc<dyn IdentityDirectory>,
        upstream: Arc<dyn UpstreamAuthority>,
        cache: Arc<SessionCache>,
        refresh: Arc<RefreshOrchestrator>,
        identity_ttl: Duration,
        access_token_ttl: Duration,
    ) -> Self {
        Self {
            validator,
            directory,
            upstream,
            cache,
            refresh,
            identity_ttl,
            access_token_ttl,
        }
    }

    /// Resolve a bearer credential to the identity it represents.
    ///
    /// # Errors
    ///
    /// [`Error::MissingCredential`] when no credential is presented,
    /// [`Error::MalformedCredential`] when it fits no known shape, and the
    /// path-specific validation, lookup and refresh errors otherwise.
    pub async fn resolve(&self, credential: Option<&str>) -> Result<Identity> {
        let raw = match credential {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(Error::MissingCredential),
        };

        // Fast path: a fresh cache entry skips validation entirely
        if let Some(identity) = self.cache.get(raw) {
            debug!(user_id = identity.user_id, "Credential resolved from cache");
            return Ok(identity);
        }

        match classifier::classify(raw) {
            CredentialKind::Malformed => Err(Error::MalformedCredential),
            CredentialKind::LocalJwt => self.resolve_local(raw).await,
            CredentialKind::UpstreamAccessToken => self.resolve_upstream(raw).await,
        }
    }

    /// Local signed-token path: verify, look up, refresh if the stored
    /// Google access token is absent.
    async fn resolve_local(&self, raw: &str) -> Result<Identity> {
        let claims = self.validator.verify(raw)?;

        let user = match claims.provider_id.as_deref() {
            Some(provider_id) => self.directory.find_by_provider_id(provider_id).await,
            None => self.directory.find_by_id(claims.sub).await,
        }
        .ok_or(Error::UnknownUser)?;

        let identity = if self.needs_refresh(&user) {
            debug!(user_id = user.user_id, "No stored access token; refreshing");
            self.refresh.refresh(&user).await?
        } else {
            user.identity()
        };

        self.cache.insert(raw, identity.clone(), self.identity_ttl);
        Ok(identity)
    }

    /// Google opaque-token path: introspect, then match the principal to a
    /// directory record, creating one on first sight. An invalid token can
    /// still identify its owner if it equals a token we persisted earlier;
    /// that owner gets a refresh attempt instead of a flat rejection.
    async fn resolve_upstream(&self, raw: &str) -> Result<Identity> {
        match self.upstream.introspect(raw).await {
            Ok(info) => {
                let user = match self.directory.find_by_provider_id(&info.provider_id).await {
                    Some(user) => user,
                    None => {
                        debug!(provider_id = %info.provider_id, "First sight of principal; creating record");
                        self.directory
                            .create(NewIdentity {
                                email: info.email.clone(),
                                provider_id: Some(info.provider_id.clone()),
                                access_token: Some(raw.to_string()),
                                ..NewIdentity::default()
                            })
                            .await?
                    }
                };

                let identity = user.identity();
                self.cache.insert(raw, identity.clone(), self.access_token_ttl);
                Ok(identity)
            }
            Err(UpstreamError::InvalidToken) => {
                // Expired upstream token: recover the owner by the stored
                // token value and refresh on their behalf
                let Some(user) = self.directory.find_by_access_token(raw).await else {
                    // A racer in a coalesced refresh can reach this lookup
                    // after the leader already persisted the new token; the
                    // leader cached the stale credential, so check there
                    // before rejecting
                    if let Some(identity) = self.cache.get(raw) {
                        debug!(user_id = identity.user_id, "Stale credential served from leader's refresh");
                        return Ok(identity);
                    }
                    warn!("Invalid upstream token with no matching record");
                    return Err(Error::UnknownUser);
                };
                debug!(user_id = user.user_id, "Stored access token stale; refreshing");
                let identity = self.refresh.refresh(&user).await?;
                // Keyed by the presented credential too, so followers of
                // this refresh resolve without another upstream roundtrip
                self.cache.insert(raw, identity.clone(), self.access_token_ttl);
                Ok(identity)
            }
            Err(UpstreamError::Timeout) => Err(Error::UpstreamTimeout),
            Err(e) => Err(Error::RefreshFailedTransient(e.to_string())),
        }
    }

    /// A linked account without a usable Google access token must refresh
    /// before downstream calls can succeed.
    fn needs_refresh(&self, user: &UserRecord) -> bool {
        user.access_token.is_none() && user.provider_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::directory::{InMemoryDirectory, NewIdentity};
    use crate::google::{TokenGrant, TokenIdentity};

    /// Scripted upstream with per-endpoint invocation counters
    struct ScriptedUpstream {
        refresh_calls: AtomicUsize,
        introspect_calls: AtomicUsize,
        refresh_response: std::result::Result<TokenGrant, UpstreamError>,
        introspect_response: std::result::Result<TokenIdentity, UpstreamError>,
        /// Delay applied to the second and later introspections, to stage a
        /// racer that arrives after the leader finished its refresh
        late_introspect_delay: Duration,
    }

    impl ScriptedUpstream {
        fn new(
            refresh_response: std::result::Result<TokenGrant, UpstreamError>,
            introspect_response: std::result::Result<TokenIdentity, UpstreamError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                refresh_calls: AtomicUsize::new(0),
                introspect_calls: AtomicUsize::new(0),
                refresh_response,
                introspect_response,
                late_introspect_delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl UpstreamAuthority for ScriptedUpstream {
        async fn exchange_code(
            &self,
            _code: &str,
        ) -> std::result::Result<TokenGrant, UpstreamError> {
            unimplemented!("not used by resolver tests")
        }

        async fn refresh(
            &self,
            _refresh_token: &str,
        ) -> std::result::Result<TokenGrant, UpstreamError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_response.clone()
        }

        async fn introspect(
            &self,
            _access_token: &str,
        ) -> std::result::Result<TokenIdentity, UpstreamError> {
            let call = self.introspect_calls.fetch_add(1, Ordering::SeqCst);
            if call > 0 && !self.late_introspect_delay.is_zero() {
                tokio::time::sleep(self.late_introspect_delay).await;
            }
            self.introspect_response.clone()
        }
    }

    fn grant(access: &str) -> std::result::Result<TokenGrant, UpstreamError> {
        Ok(TokenGrant {
            access_token: access.to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }

    fn principal(provider_id: &str, email: &str) -> std::result::Result<TokenIdentity, UpstreamError> {
        Ok(TokenIdentity {
            provider_id: provider_id.to_string(),
            email: email.to_string(),
        })
    }

    struct Harness {
        resolver: CredentialResolver,
        directory: Arc<InMemoryDirectory>,
        upstream: Arc<ScriptedUpstream>,
        validator: LocalTokenValidator,
    }

    fn harness(upstream: Arc<ScriptedUpstream>) -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        let cache = Arc::new(SessionCache::new());
        let refresh = Arc::new(RefreshOrchestrator::new(
            upstream.clone(),
            directory.clone(),
            cache.clone(),
            Duration::from_secs(3480),
        ));
        let resolver = CredentialResolver::new(
            LocalTokenValidator::new("test-secret", Duration::from_secs(3600)),
            directory.clone(),
            upstream.clone(),
            cache,
            refresh,
            Duration::from_secs(3600),
            Duration::from_secs(3480),
        );
        Harness {
            resolver,
            directory,
            upstream,
            validator: LocalTokenValidator::new("test-secret", Duration::from_secs(3600)),
        }
    }

    #[tokio::test]
    async fn no_credential_is_missing() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g", "x@example.com"),
        ));
        assert!(matches!(
            h.resolver.resolve(None).await,
            Err(Error::MissingCredential)
        ));
        assert!(matches!(
            h.resolver.resolve(Some("")).await,
            Err(Error::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn malformed_credential_is_rejected_locally() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g", "x@example.com"),
        ));
        assert!(matches!(
            h.resolver.resolve(Some("garbage")).await,
            Err(Error::MalformedCredential)
        ));
        // Neither endpoint touched
        assert_eq!(h.upstream.introspect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_upstream_token_resolves_and_caches() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g-alice", "alice@example.com"),
        ));
        h.directory
            .create(NewIdentity {
                email: "alice@example.com".to_string(),
                provider_id: Some("g-alice".to_string()),
                access_token: Some("ya29.mockvalid".to_string()),
                refresh_token: Some("refresh".to_string()),
                ..NewIdentity::default()
            })
            .await
            .unwrap();

        let first = h.resolver.resolve(Some("ya29.mockvalid")).await.unwrap();
        assert_eq!(first.email, "alice@example.com");
        assert_eq!(h.upstream.introspect_calls.load(Ordering::SeqCst), 1);

        // Second request hits the cache; no new introspection
        let second = h.resolver.resolve(Some("ya29.mockvalid")).await.unwrap();
        assert_eq!(second.user_id, first.user_id);
        assert_eq!(h.upstream.introspect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_token_for_unseen_principal_creates_a_record() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g-stranger", "stranger@example.com"),
        ));

        let identity = h.resolver.resolve(Some("ya29.mockvalid")).await.unwrap();

        assert_eq!(identity.email, "stranger@example.com");
        // Record persisted with the token we observed
        let stored = h.directory.find_by_provider_id("g-stranger").await.unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("ya29.mockvalid"));
        assert_eq!(stored.refresh_token, None);
    }

    #[tokio::test]
    async fn stale_stored_upstream_token_triggers_refresh() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.fresh"),
            Err(UpstreamError::InvalidToken),
        ));
        h.directory
            .create(NewIdentity {
                email: "alice@example.com".to_string(),
                provider_id: Some("g-alice".to_string()),
                access_token: Some("ya29.stale".to_string()),
                refresh_token: Some("refresh".to_string()),
                ..NewIdentity::default()
            })
            .await
            .unwrap();

        let identity = h.resolver.resolve(Some("ya29.stale")).await.unwrap();
        assert_eq!(identity.access_token.as_deref(), Some("ya29.fresh"));
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 1);
        // The presented credential is cached too, so followers of the
        // refresh do not repeat the introspection
        let again = h.resolver.resolve(Some("ya29.stale")).await.unwrap();
        assert_eq!(again.access_token.as_deref(), Some("ya29.fresh"));
        assert_eq!(h.upstream.introspect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn racer_arriving_after_leader_refresh_still_resolves() {
        // The racer's introspection lands after the leader has persisted
        // the new access token, so its directory lookup by the stale value
        // misses; it must be served from the leader's cache write instead
        // of failing as an unknown user.
        let upstream = Arc::new(ScriptedUpstream {
            refresh_calls: AtomicUsize::new(0),
            introspect_calls: AtomicUsize::new(0),
            refresh_response: grant("ya29.fresh"),
            introspect_response: Err(UpstreamError::InvalidToken),
            late_introspect_delay: Duration::from_millis(50),
        });
        let h = harness(upstream);
        h.directory
            .create(NewIdentity {
                email: "alice@example.com".to_string(),
                provider_id: Some("g-alice".to_string()),
                access_token: Some("ya29.stale".to_string()),
                refresh_token: Some("refresh".to_string()),
                ..NewIdentity::default()
            })
            .await
            .unwrap();

        let resolver = Arc::new(h.resolver);
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve(Some("ya29.stale")).await })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            let identity = result.unwrap().unwrap();
            assert_eq!(identity.access_token.as_deref(), Some("ya29.fresh"));
        }
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_upstream_token_with_no_record_is_unknown_user() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            Err(UpstreamError::InvalidToken),
        ));
        assert!(matches!(
            h.resolver.resolve(Some("ya29.neverseen")).await,
            Err(Error::UnknownUser)
        ));
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn introspection_timeout_surfaces_as_upstream_timeout() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            Err(UpstreamError::Timeout),
        ));
        assert!(matches!(
            h.resolver.resolve(Some("ya29.slow")).await,
            Err(Error::UpstreamTimeout)
        ));
    }

    #[tokio::test]
    async fn local_token_resolves_without_any_upstream_call() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g", "x@example.com"),
        ));
        let user = h
            .directory
            .create(NewIdentity {
                email: "bob@example.com".to_string(),
                ..NewIdentity::default()
            })
            .await
            .unwrap();
        let token = h.validator.issue(user.user_id, &user.email, None).unwrap();

        let identity = h.resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(identity.user_id, user.user_id);
        assert_eq!(h.upstream.introspect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_token_for_linked_account_without_access_token_refreshes() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.minted"),
            principal("g", "x@example.com"),
        ));
        h.directory
            .create(NewIdentity {
                email: "alice@example.com".to_string(),
                provider_id: Some("g-alice".to_string()),
                refresh_token: Some("refresh".to_string()),
                ..NewIdentity::default()
            })
            .await
            .unwrap();
        let token = h
            .validator
            .issue(1, "alice@example.com", Some("g-alice"))
            .unwrap();

        let identity = h.resolver.resolve(Some(&token)).await.unwrap();
        assert_eq!(identity.access_token.as_deref(), Some("ya29.minted"));
        assert_eq!(h.upstream.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_token_for_unknown_subject_is_unknown_user() {
        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g", "x@example.com"),
        ));
        let token = h.validator.issue(999, "ghost@example.com", None).unwrap();
        assert!(matches!(
            h.resolver.resolve(Some(&token)).await,
            Err(Error::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn expired_local_token_is_not_cached() {
        use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

        let h = harness(ScriptedUpstream::new(
            grant("ya29.unused"),
            principal("g", "x@example.com"),
        ));
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = crate::auth::local::Claims {
            sub: 1,
            email: "alice@example.com".to_string(),
            provider_id: None,
            iat: now - 7200,
            exp: now - 1,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        // Rejected every time; never promoted to the cache
        for _ in 0..2 {
            assert!(matches!(
                h.resolver.resolve(Some(&token)).await,
                Err(Error::ExpiredLocalToken)
            ));
        }
    }
}
