//! Edge-side cache of API key status

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// How long a status answer is trusted
pub const REVOCATION_TTL: Duration = Duration::from_secs(300);

/// Cached answer for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    /// Whether the key may be used
    pub active: bool,
    /// Owner according to the backend; `None` for keys the backend does not know
    pub user_id: Option<String>,
}

struct Entry {
    state: KeyState,
    cached_at: Instant,
}

/// Key ID to status, positive and negative, with TTL
pub struct RevocationCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl RevocationCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached state if younger than the TTL
    pub fn get(&self, key_id: &str) -> Option<KeyState> {
        self.entries
            .read()
            .get(key_id)
            .filter(|e| e.cached_at.elapsed() < self.ttl)
            .map(|e| e.state.clone())
    }

    /// Store a state
    pub fn set(&self, key_id: &str, state: KeyState) {
        self.entries.write().insert(
            key_id.to_string(),
            Entry {
                state,
                cached_at: Instant::now(),
            },
        );
    }

    /// Forget a key so the next use asks the backend
    pub fn invalidate(&self, key_id: &str) -> bool {
        self.entries.write().remove(key_id).is_some()
    }

    /// Drop expired entries
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, e| e.cached_at.elapsed() < ttl);
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for RevocationCache {
    fn default() -> Self {
        Self::new(REVOCATION_TTL)
    }
}
