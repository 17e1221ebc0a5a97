//! Session cache with TTL for resolved identities.
//!
//! A read-through/write-through layer in front of validation, directory
//! lookup and refresh. Keys are the SHA-256 digest of the raw credential
//! bytes, not the resolved user id: two raw tokens can resolve to the same
//! user (old vs rotated access token) and must expire independently.
//!
//! An expired entry is indistinguishable from a miss and is lazily evicted
//! on access. Every write carries a bounded TTL, never infinite.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::directory::Identity;

/// Thread-safe identity cache with per-entry TTL expiry
pub struct SessionCache {
    entries: DashMap<String, CachedIdentity>,
    stats: CacheStats,
}

/// A cached identity with TTL metadata
struct CachedIdentity {
    identity: Identity,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedIdentity {
    fn is_expired(&self) -> bool {
        Instant::now().duration_since(self.cached_at) > self.ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Entries served from cache
    pub hits: AtomicU64,
    /// Entries not found or expired
    pub misses: AtomicU64,
    /// Expired entries removed
    pub evictions: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
}

impl SessionCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Get the identity cached for a raw credential, if present and fresh.
    ///
    /// Expired entries are evicted and reported as misses.
    pub fn get(&self, raw_credential: &str) -> Option<Identity> {
        let key = cache_key(raw_credential);
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.identity.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Cache an identity under a raw credential for `ttl`
    pub fn insert(&self, raw_credential: &str, identity: Identity, ttl: Duration) {
        self.entries.insert(
            cache_key(raw_credential),
            CachedIdentity {
                identity,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop the entry for a raw credential, if any
    pub fn invalidate(&self, raw_credential: &str) {
        self.entries.remove(&cache_key(raw_credential));
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 hex digest of the raw credential bytes
fn cache_key(raw_credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_credential.as_bytes());
    hex::encode(hasher.finalize())
}
