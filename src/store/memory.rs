//! In-memory store backed by `DashMap`
//!
//! Suitable for single-process deployments and tests. Every trait in
//! [`crate::store`] is implemented here so one `Arc<MemoryStore>` can be
//! handed to every component.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ApiKeyRecord, ApiKeyStore, ContextSource, CredentialStore, ModuleSettingsStore,
    OAuthAppStore, Role, StoredOAuthApp, UsageStore, User, UserStore,
};
use crate::authz::{AccountStatus, UserContext};
use crate::{Error, Result};

/// Limits attached to a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Tool calls allowed per day
    pub daily_limit: u64,
}

/// Plan assigned to newly registered users
pub const DEFAULT_PLAN: &str = "free";

#[derive(Debug, Clone, Default)]
struct ModuleSetting {
    enabled: bool,
    tools: Option<BTreeSet<String>>,
}

/// In-memory implementation of every store contract
pub struct MemoryStore {
    credentials: DashMap<(String, String), String>,
    apps: DashMap<String, StoredOAuthApp>,
    users: DashMap<String, User>,
    clerk_index: DashMap<String, String>,
    settings: DashMap<(String, String), ModuleSetting>,
    usage: DashMap<(String, NaiveDate), u64>,
    api_keys: DashMap<String, ApiKeyRecord>,
    plans: HashMap<String, PlanLimits>,
    module_descriptions: BTreeMap<String, String>,
}

impl MemoryStore {
    /// Create a store with the given plan table and module catalog
    #[must_use]
    pub fn new(plans: HashMap<String, PlanLimits>, module_descriptions: BTreeMap<String, String>) -> Self {
        Self {
            credentials: DashMap::new(),
            apps: DashMap::new(),
            users: DashMap::new(),
            clerk_index: DashMap::new(),
            settings: DashMap::new(),
            usage: DashMap::new(),
            api_keys: DashMap::new(),
            plans,
            module_descriptions,
        }
    }

    /// Suspend or reactivate an account
    pub fn set_account_status(&self, user_id: &str, status: AccountStatus) -> Result<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        user.account_status = status;
        Ok(())
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        let plans = HashMap::from([(DEFAULT_PLAN.to_string(), PlanLimits { daily_limit: 100 })]);
        Self::new(plans, BTreeMap::new())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: &str, module: &str) -> Result<Option<String>> {
        Ok(self
            .credentials
            .get(&(user_id.to_string(), module.to_string()))
            .map(|blob| blob.clone()))
    }

    async fn upsert(&self, user_id: &str, module: &str, blob: String) -> Result<()> {
        self.credentials
            .insert((user_id.to_string(), module.to_string()), blob);
        Ok(())
    }

    async fn delete(&self, user_id: &str, module: &str) -> Result<bool> {
        Ok(self
            .credentials
            .remove(&(user_id.to_string(), module.to_string()))
            .is_some())
    }

    async fn list_modules(&self, user_id: &str) -> Result<Vec<String>> {
        let mut modules: Vec<String> = self
            .credentials
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.key().1.clone())
            .collect();
        modules.sort();
        Ok(modules)
    }
}

#[async_trait]
impl OAuthAppStore for MemoryStore {
    async fn get_app(&self, provider: &str) -> Result<Option<StoredOAuthApp>> {
        Ok(self.apps.get(provider).map(|app| app.clone()))
    }

    async fn upsert_app(&self, provider: &str, app: StoredOAuthApp) -> Result<()> {
        self.apps.insert(provider.to_string(), app);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }

    async fn get_user_by_clerk_id(&self, clerk_id: &str) -> Result<Option<User>> {
        let Some(user_id) = self.clerk_index.get(clerk_id).map(|id| id.clone()) else {
            return Ok(None);
        };
        self.get_user(&user_id).await
    }

    async fn create_user(&self, clerk_id: &str, email: &str) -> Result<User> {
        // The entry guard serializes concurrent registrations of one subject
        let entry = self.clerk_index.entry(clerk_id.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            if let Some(user) = self.users.get(existing.get()) {
                return Ok(user.clone());
            }
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            clerk_id: clerk_id.to_string(),
            email: email.to_string(),
            role: Role::User,
            account_status: AccountStatus::Active,
            plan_id: DEFAULT_PLAN.to_string(),
            created_at: Utc::now(),
        };
        self.users.insert(user.id.clone(), user.clone());
        entry.insert(user.id.clone());
        debug!(user_id = %user.id, "Created user");
        Ok(user)
    }

    async fn set_plan(&self, user_id: &str, plan_id: &str) -> Result<()> {
        if !self.plans.contains_key(plan_id) {
            return Err(Error::NotFound(format!("plan {plan_id}")));
        }
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        user.plan_id = plan_id.to_string();
        Ok(())
    }

    async fn set_role(&self, user_id: &str, role: Role) -> Result<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
        user.role = role;
        Ok(())
    }
}

#[async_trait]
impl ModuleSettingsStore for MemoryStore {
    async fn set_module(
        &self,
        user_id: &str,
        module: &str,
        enabled: bool,
        tools: Option<Vec<String>>,
    ) -> Result<()> {
        self.settings.insert(
            (user_id.to_string(), module.to_string()),
            ModuleSetting {
                enabled,
                tools: tools.map(|t| t.into_iter().collect()),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ContextSource for MemoryStore {
    async fn load_user_context(&self, user_id: &str) -> Result<UserContext> {
        let user = self
            .users
            .get(user_id)
            .map(|u| u.clone())
            .ok_or(Error::UserNotFound)?;

        let daily_limit = self
            .plans
            .get(&user.plan_id)
            .map_or(0, |plan| plan.daily_limit);

        let daily_used = self
            .usage
            .get(&(user_id.to_string(), Self::today()))
            .map_or(0, |count| *count);

        let mut enabled_modules = BTreeSet::new();
        let mut enabled_tools = BTreeMap::new();
        for entry in self.settings.iter().filter(|e| e.key().0 == user_id) {
            let setting = entry.value();
            if !setting.enabled {
                continue;
            }
            let module = entry.key().1.clone();
            if let Some(tools) = &setting.tools {
                enabled_tools.insert(module.clone(), tools.clone());
            }
            enabled_modules.insert(module);
        }

        let module_descriptions = self
            .module_descriptions
            .iter()
            .filter(|(module, _)| enabled_modules.contains(*module))
            .map(|(m, d)| (m.clone(), d.clone()))
            .collect();

        Ok(UserContext {
            account_status: user.account_status,
            plan_id: user.plan_id,
            daily_used,
            daily_limit,
            enabled_modules,
            enabled_tools,
            module_descriptions,
        })
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_usage(&self, user_id: &str, module: &str, tool: &str, count: u64) -> Result<()> {
        let mut total = self
            .usage
            .entry((user_id.to_string(), Self::today()))
            .or_insert(0);
        *total = total.saturating_add(count);
        debug!(user_id = %user_id, module = %module, tool = %tool, count, "Recorded usage");
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn insert_api_key(&self, record: ApiKeyRecord) -> Result<()> {
        self.api_keys.insert(record.key_id.clone(), record);
        Ok(())
    }

    async fn get_api_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.api_keys.get(key_id).map(|k| k.clone()))
    }

    async fn revoke_api_key(&self, key_id: &str) -> Result<bool> {
        Ok(self
            .api_keys
            .get_mut(key_id)
            .map(|mut record| record.revoked = true)
            .is_some())
    }

    async fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let mut keys: Vec<ApiKeyRecord> = self
            .api_keys
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }
}
