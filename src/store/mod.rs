//! Store contracts
//!
//! The trust subsystem only needs get/upsert/delete access to a relational
//! store keyed by user ID and module name. Each concern is a small trait so
//! the broker, the authorization cache and the HTTP surfaces can be wired to
//! different backends (or fakes in tests). [`MemoryStore`] implements all of
//! them on top of `DashMap`.
//!
//! Implementations must be `Send + Sync` because stores are shared across
//! async tasks.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::authz::{AccountStatus, UserContext};

pub use memory::{MemoryStore, PlanLimits};

/// Encrypted credential blobs keyed by (user, module).
///
/// The store never sees plaintext; see [`crate::broker::CredentialVault`].
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Fetch the encrypted blob for a (user, module) pair
    async fn get(&self, user_id: &str, module: &str) -> Result<Option<String>>;

    /// Insert or replace the encrypted blob for a (user, module) pair
    async fn upsert(&self, user_id: &str, module: &str, blob: String) -> Result<()>;

    /// Delete the credential. Returns `true` if one existed.
    async fn delete(&self, user_id: &str, module: &str) -> Result<bool>;

    /// Modules the user has stored credentials for
    async fn list_modules(&self, user_id: &str) -> Result<Vec<String>>;
}

/// OAuth application registration as persisted (secret encrypted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOAuthApp {
    /// Client ID
    pub client_id: String,
    /// Client secret, encrypted with the credential cipher
    pub client_secret_encrypted: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Whether the app may be used
    pub enabled: bool,
}

/// Admin-managed OAuth app registry keyed by provider
#[async_trait]
pub trait OAuthAppStore: Send + Sync + 'static {
    /// Fetch the app registration for a provider
    async fn get_app(&self, provider: &str) -> Result<Option<StoredOAuthApp>>;

    /// Insert or replace the app registration for a provider
    async fn upsert_app(&self, provider: &str, app: StoredOAuthApp) -> Result<()>;
}

/// Role of an internal user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular user
    #[default]
    User,
    /// Operator with access to admin routes
    Admin,
}

/// Internal user row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal user ID
    pub id: String,
    /// Identity-provider subject the user registered with
    pub clerk_id: String,
    /// Email address
    pub email: String,
    /// Role
    pub role: Role,
    /// Account status
    pub account_status: AccountStatus,
    /// Plan identifier
    pub plan_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// User rows
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Look up a user by internal ID
    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Look up a user by identity-provider subject
    async fn get_user_by_clerk_id(&self, clerk_id: &str) -> Result<Option<User>>;

    /// Create a user for a registrant, or return the existing row
    async fn create_user(&self, clerk_id: &str, email: &str) -> Result<User>;

    /// Change a user's plan
    async fn set_plan(&self, user_id: &str, plan_id: &str) -> Result<()>;

    /// Change a user's role
    async fn set_role(&self, user_id: &str, role: Role) -> Result<()>;
}

/// Per-user module settings
#[async_trait]
pub trait ModuleSettingsStore: Send + Sync + 'static {
    /// Enable or disable a module; `tools` restricts enabled tools when `Some`
    async fn set_module(
        &self,
        user_id: &str,
        module: &str,
        enabled: bool,
        tools: Option<Vec<String>>,
    ) -> Result<()>;
}

/// Authoritative source of [`UserContext`]
#[async_trait]
pub trait ContextSource: Send + Sync + 'static {
    /// Compute the user's authorization context from the store
    async fn load_user_context(&self, user_id: &str) -> Result<UserContext>;
}

/// Usage counters
#[async_trait]
pub trait UsageStore: Send + Sync + 'static {
    /// Record `count` calls of `module:tool` for today
    async fn record_usage(&self, user_id: &str, module: &str, tool: &str, count: u64) -> Result<()>;
}

/// Issued API key as persisted by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Key identifier (also the `kid` claim of the key token)
    pub key_id: String,
    /// Owner
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Creation time (Unix seconds)
    pub created_at: i64,
    /// Expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Whether the key was revoked
    pub revoked: bool,
}

/// API key records; the revocation authority for API keys
#[async_trait]
pub trait ApiKeyStore: Send + Sync + 'static {
    /// Record a newly issued key
    async fn insert_api_key(&self, record: ApiKeyRecord) -> Result<()>;

    /// Fetch a key record
    async fn get_api_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>>;

    /// Mark a key revoked. Returns `true` if the key existed.
    async fn revoke_api_key(&self, key_id: &str) -> Result<bool>;

    /// Keys owned by a user
    async fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>>;
}
