//! TTL cache of user contexts with stale retention
//!
//! Entries are served by [`ContextCache::get`] only while fresh. Expired
//! entries are kept so [`ContextCache::get_stale`] can still answer when the
//! authoritative store is down, until they pass the stale horizon and
//! [`ContextCache::evict_stale`] drops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::UserContext;

/// Default freshness window of a cached context
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(30);

/// How long an untouched context is retained for stale fallback
pub const DEFAULT_STALE_HORIZON: Duration = Duration::from_secs(3600);

/// A cached context with the time it was stored
struct CachedContext {
    context: UserContext,
    cached_at: Instant,
}

/// Reader/writer-locked map of user ID to context
pub struct ContextCache {
    entries: RwLock<HashMap<String, CachedContext>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

impl ContextCache {
    /// Create an empty cache with the given freshness window
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
        }
    }

    /// Freshness window
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a context if it is younger than the TTL
    pub fn get(&self, user_id: &str) -> Option<UserContext> {
        let entries = self.entries.read();
        match entries.get(user_id) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.context.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Get a context regardless of age
    pub fn get_stale(&self, user_id: &str) -> Option<UserContext> {
        let context = self
            .entries
            .read()
            .get(user_id)
            .map(|entry| entry.context.clone());
        if context.is_some() {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        context
    }

    /// Store a context, resetting its age
    pub fn set(&self, user_id: &str, context: UserContext) {
        self.entries.write().insert(
            user_id.to_string(),
            CachedContext {
                context,
                cached_at: Instant::now(),
            },
        );
    }

    /// Remove a context from both the fresh and the stale view
    pub fn delete(&self, user_id: &str) {
        self.entries.write().remove(user_id);
    }

    /// Bump `daily_used` of a cached context without changing its age
    pub fn add_usage(&self, user_id: &str, count: u64) {
        if let Some(entry) = self.entries.write().get_mut(user_id) {
            entry.context.daily_used = entry.context.daily_used.saturating_add(count);
        }
    }

    /// Drop contexts not stored within `horizon`, returning how many went
    pub fn evict_stale(&self, horizon: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < horizon);
        before - entries.len()
    }

    /// Number of cached contexts (fresh and stale)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Counters as (hits, misses, stale hits)
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.stale_hits.load(Ordering::Relaxed),
        )
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::authz::AccountStatus;

    fn context(used: u64) -> UserContext {
        UserContext {
            account_status: AccountStatus::Active,
            plan_id: "free".to_string(),
            daily_used: used,
            daily_limit: 100,
            enabled_modules: BTreeSet::new(),
            enabled_tools: BTreeMap::new(),
            module_descriptions: BTreeMap::new(),
        }
    }

    #[test]
    fn fresh_entry_is_served() {
        let cache = ContextCache::new(Duration::from_secs(60));
        cache.set("u1", context(1));
        assert_eq!(cache.get("u1"), Some(context(1)));
        assert_eq!(cache.stats().0, 1);
    }

    #[test]
    fn expired_entry_is_stale_only() {
        let cache = ContextCache::new(Duration::from_millis(5));
        cache.set("u1", context(1));

        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(cache.get("u1"), None);
        // Still retained for fallback
        assert_eq!(cache.get_stale("u1"), Some(context(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_clears_both_views() {
        let cache = ContextCache::new(Duration::from_secs(60));
        cache.set("u1", context(1));
        cache.delete("u1");
        assert_eq!(cache.get("u1"), None);
        assert_eq!(cache.get_stale("u1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn add_usage_bumps_cached_entry() {
        let cache = ContextCache::new(Duration::from_secs(60));
        cache.set("u1", context(5));
        cache.add_usage("u1", 3);
        assert_eq!(cache.get("u1").unwrap().daily_used, 8);

        // Unknown users are ignored
        cache.add_usage("u2", 3);
        assert_eq!(cache.get_stale("u2"), None);
    }

    #[test]
    fn evict_stale_drops_only_old_entries() {
        let cache = ContextCache::new(Duration::from_millis(5));
        cache.set("old", context(1));
        std::thread::sleep(Duration::from_millis(40));
        cache.set("recent", context(2));

        assert_eq!(cache.evict_stale(Duration::from_millis(20)), 1);
        assert_eq!(cache.get_stale("old"), None);
        // Expired but inside the horizon: still there for fallback
        assert_eq!(cache.get_stale("recent"), Some(context(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_resets_age() {
        let cache = ContextCache::new(Duration::from_millis(20));
        cache.set("u1", context(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("u1"), None);

        cache.set("u1", context(2));
        assert_eq!(cache.get("u1"), Some(context(2)));
    }
}
