//! Effective capability cache
//!
//! Memoizes each user's effective capability set for a short TTL. An entry is
//! also dropped as soon as the evaluation instant reaches the next time
//! boundary of the user's memberships or exceptions, so expiry never waits for
//! the TTL. Every ledger write for a user must call [`CapabilityCache::invalidate`].
//!
//! Access checks never read this cache; it only serves the
//! `effective_capabilities` projection.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{CapabilityCode, UserId};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of users held
    pub capacity: usize,

    /// Time-to-live of an entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(5),
        }
    }
}

/// Invalidation stamp read before computing a set and handed back to
/// [`CapabilityCache::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    /// Bumped by [`CapabilityCache::clear`]
    epoch: u64,

    /// Bumped by [`CapabilityCache::invalidate`]
    user: u64,
}

#[derive(Clone)]
struct CachedEntry {
    capabilities: Arc<BTreeSet<CapabilityCode>>,
    generation: Generation,
    cached_at: Instant,

    /// Instant the set was computed for
    computed_for: DateTime<Utc>,

    /// First instant at which the set may differ
    valid_until: Option<DateTime<Utc>>,
}

impl CachedEntry {
    fn is_stale(&self, ttl: Duration, as_of: DateTime<Utc>) -> bool {
        self.cached_at.elapsed() > ttl
            || as_of < self.computed_for
            || self.valid_until.map_or(false, |until| as_of >= until)
    }
}

/// Per-user effective capability cache
pub struct CapabilityCache {
    entries: DashMap<UserId, CachedEntry>,

    /// Bumped on every invalidation; a computation started before the bump
    /// must not be stored
    generations: DashMap<UserId, u64>,

    /// Bumped on every full clear; per-user counters restart under a new epoch
    epoch: AtomicU64,

    config: CacheConfig,

    hits: AtomicUsize,
    misses: AtomicUsize,
    expirations: AtomicUsize,
    invalidations: AtomicUsize,
}

impl CapabilityCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            epoch: AtomicU64::new(0),
            config,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            expirations: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    /// Cached set for `user_id` if still valid at `as_of`
    pub fn get(&self, user_id: UserId, as_of: DateTime<Utc>) -> Option<Arc<BTreeSet<CapabilityCode>>> {
        if let Some(entry) = self.entries.get(&user_id) {
            if entry.is_stale(self.config.ttl, as_of) {
                drop(entry);
                let ttl = self.config.ttl;
                if self
                    .entries
                    .remove_if(&user_id, |_, e| e.is_stale(ttl, as_of))
                    .is_some()
                {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.capabilities.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Current generation for a user; pass it back to [`put`](Self::put)
    pub fn generation(&self, user_id: UserId) -> Generation {
        let epoch = self.epoch.load(Ordering::Acquire);
        let user = self.generations.get(&user_id).map(|g| *g).unwrap_or(0);
        Generation { epoch, user }
    }

    /// Store a set computed at `as_of`. Ignored when the user was invalidated
    /// after `generation` was read.
    pub fn put(
        &self,
        user_id: UserId,
        generation: Generation,
        capabilities: BTreeSet<CapabilityCode>,
        as_of: DateTime<Utc>,
        valid_until: Option<DateTime<Utc>>,
    ) -> bool {
        if self.generation(user_id) != generation {
            return false;
        }

        if self.entries.len() >= self.config.capacity && !self.entries.contains_key(&user_id) {
            self.evict_oldest();
        }

        self.entries.insert(
            user_id,
            CachedEntry {
                capabilities: Arc::new(capabilities),
                generation,
                cached_at: Instant::now(),
                computed_for: as_of,
                valid_until,
            },
        );

        // An invalidation may have landed between the check and the insert
        if self.generation(user_id) != generation {
            self.entries
                .remove_if(&user_id, |_, e| e.generation == generation);
            return false;
        }
        true
    }

    /// Drop a user's entry after any ledger write that affects them
    pub fn invalidate(&self, user_id: UserId) {
        *self.generations.entry(user_id).or_insert(0) += 1;
        self.entries.remove(&user_id);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every entry (catalog or group bundle changes)
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.generations.clear();
        self.entries.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.len(),
            max_entries: self.config.capacity,
        }
    }

    /// Remove roughly 10% of entries, oldest first
    fn evict_oldest(&self) {
        let to_remove = (self.config.capacity / 10).max(1);

        let mut ages: Vec<(UserId, Instant)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().cached_at))
            .collect();
        ages.sort_by_key(|(_, cached_at)| *cached_at);

        for (user_id, _) in ages.into_iter().take(to_remove) {
            self.entries.remove(&user_id);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    pub invalidations: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
