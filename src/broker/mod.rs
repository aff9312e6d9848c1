//! Token broker
//!
//! Module wrappers ask the broker for a credential and get back something
//! usable: OAuth 2.0 tokens that are inside the refresh window are renewed
//! against the provider first. Refresh failures never fail the call; the
//! caller gets the credential that was stored and the provider call decides.

pub mod exchange;
pub mod recipe;
mod vault;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::credential::Credential;
use crate::{Error, Result};

pub use recipe::{BodyEncoding, ClientAuth, RecipeRegistry, RefreshRecipe};
pub use vault::{AppCredentials, CredentialVault};

/// Default refresh window before expiry
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// Default timeout of provider token requests
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a token expiring at `expires_at` must be refreshed at `now`.
///
/// `expires_at == 0` means the token never expires.
#[must_use]
pub fn needs_refresh(expires_at: i64, now: i64, buffer: Duration) -> bool {
    let buffer = i64::try_from(buffer.as_secs()).unwrap_or(i64::MAX);
    expires_at != 0 && now >= expires_at.saturating_sub(buffer)
}

/// Build the HTTP client used for provider token requests
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn provider_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("mcpist/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}

/// Credential broker with transparent refresh
pub struct TokenBroker {
    vault: CredentialVault,
    recipes: RecipeRegistry,
    http: Client,
    refresh_buffer: Duration,
    /// One lock per (user, module) while a refresh is in flight
    inflight: InflightMap,
}

impl TokenBroker {
    /// Create a broker
    pub fn new(vault: CredentialVault, recipes: RecipeRegistry, http: Client) -> Self {
        Self {
            vault,
            recipes,
            http,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            inflight: DashMap::new(),
        }
    }

    /// Override the refresh window
    #[must_use]
    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Credential vault
    #[must_use]
    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Recipe registry
    #[must_use]
    pub fn recipes(&self) -> &RecipeRegistry {
        &self.recipes
    }

    /// Get a usable credential for a (user, module) pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no credential is stored, or the
    /// store/decryption error. Refresh failures are not errors.
    pub async fn get_module_token(&self, user_id: &str, module: &str) -> Result<Credential> {
        let credential = self.load(user_id, module).await?;
        if !self.due(&credential) {
            return Ok(credential);
        }

        let slot = InflightSlot::acquire(&self.inflight, user_id, module);
        let _guard = slot.lock.lock().await;

        // A peer may have refreshed while we waited
        let current = self.load(user_id, module).await?;
        if !self.due(&current) {
            debug!(user_id = %user_id, module = %module, "Reusing credential refreshed by peer");
            return Ok(current);
        }

        match self.refresh(user_id, module, &current).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                warn!(user_id = %user_id, module = %module, error = %e, "Token refresh failed, using stored credential");
                Ok(current)
            }
        }
    }

    /// Build the provider authorization URL for the connect flow
    ///
    /// # Errors
    ///
    /// Returns an error if the module has no recipe or its provider no
    /// enabled OAuth app.
    pub async fn authorization_url(&self, module: &str, state: &str) -> Result<String> {
        let recipe = self.recipe(module)?;
        let app = self.app(&recipe).await?;

        let mut url = Url::parse(&recipe.authorize_url)
            .map_err(|e| Error::Config(format!("Invalid authorize URL for {}: {e}", recipe.provider)))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &app.client_id);
            params.append_pair("redirect_uri", &app.redirect_uri);
            params.append_pair("state", state);
            if !recipe.scopes.is_empty() {
                params.append_pair("scope", &recipe.scopes.join(" "));
            }
            for (key, value) in &recipe.authorize_params {
                params.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    /// Exchange an authorization code and store the resulting credential
    ///
    /// # Errors
    ///
    /// Returns an error if the module has no recipe, the provider has no
    /// enabled app, the exchange fails, or the credential cannot be stored.
    pub async fn exchange_code(&self, user_id: &str, module: &str, code: &str) -> Result<Credential> {
        let recipe = self.recipe(module)?;
        let app = self.app(&recipe).await?;

        let grant = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", app.redirect_uri.as_str()),
        ];
        let (response, access_token) =
            exchange::request_token(&self.http, &recipe, &app, &grant).await?;
        let credential =
            exchange::exchanged_credential(&response, access_token, Utc::now().timestamp());

        self.vault.put(user_id, module, &credential).await?;
        info!(user_id = %user_id, module = %module, "Connected module");
        Ok(credential)
    }

    async fn load(&self, user_id: &str, module: &str) -> Result<Credential> {
        self.vault
            .get(user_id, module)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no credential for module {module}")))
    }

    fn due(&self, credential: &Credential) -> bool {
        credential.refreshable().is_some_and(|(token, _)| {
            needs_refresh(token.expires_at, Utc::now().timestamp(), self.refresh_buffer)
        })
    }

    fn recipe(&self, module: &str) -> Result<Arc<RefreshRecipe>> {
        self.recipes
            .for_module(module)
            .ok_or_else(|| Error::Provider(format!("no OAuth recipe for module {module}")))
    }

    async fn app(&self, recipe: &RefreshRecipe) -> Result<AppCredentials> {
        let app = self
            .vault
            .app_credentials(&recipe.provider)
            .await?
            .ok_or_else(|| Error::Provider(format!("no OAuth app for provider {}", recipe.provider)))?;
        if !app.enabled {
            return Err(Error::Provider(format!("OAuth app for {} is disabled", recipe.provider)));
        }
        Ok(app)
    }

    async fn refresh(&self, user_id: &str, module: &str, credential: &Credential) -> Result<Credential> {
        let Some((_, refresh_token)) = credential.refreshable() else {
            return Ok(credential.clone());
        };

        let recipe = self.recipe(module)?;
        let app = self.app(&recipe).await?;

        let grant = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        let (response, access_token) =
            exchange::request_token(&self.http, &recipe, &app, &grant).await?;
        let refreshed = exchange::refreshed_credential(
            credential,
            &response,
            access_token,
            recipe.rotates_refresh_token,
            Utc::now().timestamp(),
        );

        // The provider may already have invalidated the old refresh token,
        // so the new credential is returned even if persisting fails.
        if let Err(e) = self.vault.put(user_id, module, &refreshed).await {
            error!(user_id = %user_id, module = %module, error = %e, "Failed to persist refreshed credential");
        }

        info!(user_id = %user_id, module = %module, provider = %recipe.provider, "Token refreshed");
        Ok(refreshed)
    }
}

type InflightMap = DashMap<(String, String), Arc<Mutex<()>>>;

/// Shared refresh lock of one (user, module) pair, released from the map on
/// drop once no other task holds it
struct InflightSlot<'a> {
    map: &'a InflightMap,
    key: (String, String),
    lock: Arc<Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn acquire(map: &'a InflightMap, user_id: &str, module: &str) -> Self {
        let key = (user_id.to_string(), module.to_string());
        let lock = Arc::clone(map.entry(key.clone()).or_default().value());
        Self { map, key, lock }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and ours
        self.map
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}
