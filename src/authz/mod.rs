//! Authorization context
//!
//! Low-latency view of each user's plan, quota and module settings. Reads
//! come from a short-TTL [`ContextCache`]; misses load from the
//! authoritative [`ContextSource`]. When the store fails, a previously
//! cached value is served (and re-armed for another TTL) so a store outage
//! does not take tool execution down with it.

mod cache;
mod context;
mod gate;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::store::{ContextSource, UsageStore};

pub use cache::{ContextCache, DEFAULT_CONTEXT_TTL, DEFAULT_STALE_HORIZON};
pub use context::{AccountStatus, UserContext};
pub use gate::{ToolGate, ToolGrant};

/// Cached, fault-tolerant access to user contexts
pub struct AuthorizationContext {
    source: Arc<dyn ContextSource>,
    usage: Arc<dyn UsageStore>,
    cache: ContextCache,
}

impl AuthorizationContext {
    /// Create a new authorization context
    pub fn new(source: Arc<dyn ContextSource>, usage: Arc<dyn UsageStore>, ttl: Duration) -> Self {
        Self {
            source,
            usage,
            cache: ContextCache::new(ttl),
        }
    }

    /// Underlying cache
    #[must_use]
    pub fn cache(&self) -> &ContextCache {
        &self.cache
    }

    /// Get a user's context.
    ///
    /// # Errors
    ///
    /// Returns the store error only when the load fails and nothing is
    /// cached for the user, fresh or stale.
    pub async fn get_user_context(&self, user_id: &str) -> Result<UserContext> {
        if let Some(context) = self.cache.get(user_id) {
            return Ok(context);
        }

        match self.source.load_user_context(user_id).await {
            Ok(context) => {
                self.cache.set(user_id, context.clone());
                Ok(context)
            }
            Err(e) => {
                if let Some(stale) = self.cache.get_stale(user_id) {
                    warn!(user_id = %user_id, error = %e, "Context load failed, serving stale value");
                    self.cache.set(user_id, stale.clone());
                    Ok(stale)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Drop a user's cached context so the next read hits the store
    pub fn invalidate_cache(&self, user_id: &str) {
        debug!(user_id = %user_id, "Invalidating user context");
        self.cache.delete(user_id);
    }

    /// Record tool usage without blocking the caller.
    ///
    /// The cached `daily_used` is bumped immediately; the store write runs on
    /// a spawned task and failures are only logged.
    pub fn record_usage(&self, user_id: &str, module: &str, tool: &str, count: u64) {
        self.cache.add_usage(user_id, count);

        let usage = Arc::clone(&self.usage);
        let user_id = user_id.to_string();
        let module = module.to_string();
        let tool = tool.to_string();
        tokio::spawn(async move {
            if let Err(e) = usage.record_usage(&user_id, &module, &tool, count).await {
                warn!(user_id = %user_id, module = %module, tool = %tool, error = %e, "Failed to record usage");
            }
        });
    }
}
