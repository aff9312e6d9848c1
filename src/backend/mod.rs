//! Backend API
//!
//! Trusts nothing but gateway assertions minted by the edge. Owns users,
//! module settings, the credential vault, API keys and the OAuth connect
//! flow.

mod auth;
mod router;

pub use auth::{AdminUser, InternalCaller, Registrant, StandardUser};
pub use router::create_router;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::apikey::{ApiKeyIssuer, RevocationNotifier};
use crate::authz::{AuthorizationContext, DEFAULT_STALE_HORIZON};
use crate::broker::{CredentialVault, RecipeRegistry, TokenBroker, provider_client};
use crate::cipher::Cipher;
use crate::config::{BackendConfig, Config, join_url, resolve_secret};
use crate::http::shutdown_signal;
use crate::oauth_state::StateSigner;
use crate::store::{MemoryStore, ModuleSettingsStore, UserStore};
use crate::trust::{Ed25519Key, GatewayVerifier, JWKS_PATH, JwksCache, TrustBridge, apikey_kid};
use crate::{Error, Result};

/// Shared backend state
pub struct BackendState {
    /// Verifies gateway assertions and resolves callers
    pub bridge: TrustBridge,
    /// Token broker (and through it the vault)
    pub broker: Arc<TokenBroker>,
    /// Authorization context cache
    pub authz: Arc<AuthorizationContext>,
    /// OAuth state signer
    pub states: StateSigner,
    /// API key authority
    pub api_keys: ApiKeyIssuer,
    /// User rows
    pub users: Arc<dyn UserStore>,
    /// Module settings
    pub settings: Arc<dyn ModuleSettingsStore>,
    /// Module catalog; empty accepts any module name
    pub modules: BTreeMap<String, String>,
    /// Subjects promoted to admin on registration
    pub admin_clerk_ids: Vec<String>,
    /// Default landing page after the OAuth callback
    pub oauth_return_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl BackendState {
    /// Reject module names outside a non-empty catalog
    pub(crate) fn known_module(&self, module: &str) -> Result<()> {
        if self.modules.is_empty() || self.modules.contains_key(module) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("module {module}")))
        }
    }
}

/// Tells the edge to drop its cached status of a revoked key
pub struct EdgeNotifier {
    http: reqwest::Client,
    edge_url: String,
    internal_secret: String,
}

impl EdgeNotifier {
    /// Create a notifier for the edge at `edge_url`
    pub fn new(http: reqwest::Client, edge_url: impl Into<String>, internal_secret: impl Into<String>) -> Self {
        Self {
            http,
            edge_url: edge_url.into(),
            internal_secret: internal_secret.into(),
        }
    }
}

#[async_trait]
impl RevocationNotifier for EdgeNotifier {
    async fn key_revoked(&self, key_id: &str) -> Result<()> {
        let url = join_url(&self.edge_url, &format!("/internal/apikeys/{key_id}/invalidate"));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.internal_secret)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("cache-bust request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "edge answered cache-bust with {}",
                response.status()
            )));
        }
        debug!(key_id = %key_id, "Edge cache busted");
        Ok(())
    }
}

/// Built-in recipes with configured overrides and additions applied
#[must_use]
pub fn build_recipes(config: &BackendConfig) -> RecipeRegistry {
    let mut recipes = RecipeRegistry::builtin();

    for custom in &config.recipes {
        let modules: Vec<&str> = custom.modules.iter().map(String::as_str).collect();
        recipes.register(custom.recipe.clone(), &modules);
        info!(provider = %custom.recipe.provider, modules = ?custom.modules, "Registered provider recipe");
    }

    for (provider, endpoints) in &config.providers {
        let mut known = true;
        if let Some(token_url) = &endpoints.token_url {
            known &= recipes.override_token_url(provider, token_url);
        }
        if let Some(authorize_url) = &endpoints.authorize_url {
            known &= recipes.override_authorize_url(provider, authorize_url);
        }
        if !known {
            warn!(provider = %provider, "Endpoint override for unknown provider ignored");
        }
    }

    recipes
}

/// Backend server
pub struct BackendServer {
    state: Arc<BackendState>,
    addr: SocketAddr,
}

impl BackendServer {
    /// Build the backend from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a secret is missing or malformed.
    pub fn new(config: &Config) -> Result<Self> {
        let backend = &config.backend;

        let cipher = Cipher::from_base64(&resolve_secret("backend.encryption_key", &backend.encryption_key)?)?;
        let states = StateSigner::new(resolve_secret("backend.state_secret", &backend.state_secret)?.as_bytes())?;
        let apikey_seed = resolve_secret("backend.apikey_seed", &backend.apikey_seed)?;
        let apikey_key = Ed25519Key::from_base64_seed(&apikey_seed, apikey_kid(&backend.apikey_key_version))?;
        let internal_secret = resolve_secret("backend.internal_secret", &backend.internal_secret)?;

        let store = Arc::new(MemoryStore::new(backend.plans.clone(), backend.modules.clone()));

        let vault = CredentialVault::new(cipher, store.clone(), store.clone());
        let broker = Arc::new(
            TokenBroker::new(vault, build_recipes(backend), provider_client(backend.provider_timeout)?)
                .with_refresh_buffer(backend.refresh_buffer),
        );
        let authz = Arc::new(AuthorizationContext::new(
            store.clone(),
            store.clone(),
            backend.context_ttl,
        ));

        let peer = reqwest::Client::builder()
            .timeout(config.server.peer_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        let jwks_url = backend
            .gateway_jwks_url
            .clone()
            .unwrap_or_else(|| join_url(&backend.edge_url, JWKS_PATH));
        let verifier = GatewayVerifier::new(Arc::new(JwksCache::remote(jwks_url, peer.clone())));
        let bridge = TrustBridge::new(verifier, store.clone());

        let notifier = EdgeNotifier::new(peer, backend.edge_url.clone(), internal_secret);
        let api_keys = ApiKeyIssuer::new(apikey_key, store.clone()).with_notifier(Arc::new(notifier));

        let addr: SocketAddr = format!("{}:{}", backend.host, backend.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid backend address: {e}")))?;

        let state = Arc::new(BackendState {
            bridge,
            broker,
            authz,
            states,
            api_keys,
            users: store.clone(),
            settings: store,
            modules: backend.modules.clone(),
            admin_clerk_ids: backend.admin_clerk_ids.clone(),
            oauth_return_url: backend.oauth_return_url.clone(),
            request_timeout: config.server.request_timeout,
        });

        Ok(Self { state, addr })
    }

    /// Shared state
    pub fn state(&self) -> Arc<BackendState> {
        Arc::clone(&self.state)
    }

    /// Serve until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<()> {
        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            addr = %self.addr,
            providers = self.state.broker.recipes().providers().len(),
            modules = self.state.modules.len(),
            "MCPist backend listening"
        );

        // Contexts of users who stopped calling would otherwise stay forever
        let authz = Arc::clone(&self.state.authz);
        let period = authz.cache().ttl().max(Duration::from_secs(1));
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = authz.cache().evict_stale(DEFAULT_STALE_HORIZON);
                if evicted > 0 {
                    debug!(evicted, "Evicted stale user contexts");
                }
            }
        });

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        sweeper.abort();
        served.map_err(|e| Error::Internal(e.to_string()))?;

        info!("Backend shutdown complete");
        Ok(())
    }
}
