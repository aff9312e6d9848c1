//! Configuration management
//!
//! One file configures both processes; each reads its own section. Values
//! come from an optional YAML file overlaid with `MCPIST_`-prefixed
//! environment variables (`MCPIST_BACKEND__PORT=9000`). Secret fields accept
//! `env:VAR_NAME` so the file itself never holds key material. URL fields
//! expand `${VAR}` and `${VAR:-default}`.

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::Path,
    sync::LazyLock,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::broker::RefreshRecipe;
use crate::store::PlanLimits;
use crate::{Error, Result};

/// `${VAR}` or `${VAR:-default}`
static ENV_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("valid pattern"));

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` secrets.
    /// Paths support ~ expansion. Later files override earlier ones.
    pub env_files: Vec<String>,
    /// Settings shared by both servers
    pub server: ServerConfig,
    /// Edge gateway
    pub edge: EdgeConfig,
    /// Backend API
    pub backend: BackendConfig,
}

/// Settings shared by both servers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Timeout of calls to the peer process (JWKS, status, cache-bust, proxy)
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(10),
        }
    }
}

/// Edge gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Base URL of the backend
    pub backend_url: String,
    /// Base64 Ed25519 seed of the assertion signing key (supports `env:VAR`)
    pub signing_seed: String,
    /// Version tag of the signing key (`kid = mcpist-gateway-<version>`)
    pub key_version: String,
    /// Retired signing keys whose public halves are still published
    pub retired_keys: Vec<RetiredKey>,
    /// Bearer secret the backend presents on cache-bust calls (supports `env:VAR`)
    pub internal_secret: String,
    /// JWKS of the backend's API key signer; defaults to the backend's well-known path
    pub api_key_jwks_url: Option<String>,
    /// How long an API key status answer is cached
    #[serde(with = "humantime_serde")]
    pub revocation_ttl: Duration,
    /// Identity provider of browser sessions
    pub session: SessionConfig,
    /// Paths forwarded without caller authentication
    pub public_paths: Vec<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            backend_url: "http://127.0.0.1:8081".to_string(),
            signing_seed: String::new(),
            key_version: "v1".to_string(),
            retired_keys: Vec::new(),
            internal_secret: String::new(),
            api_key_jwks_url: None,
            revocation_ttl: Duration::from_secs(300),
            session: SessionConfig::default(),
            public_paths: vec!["/oauth/callback".to_string()],
        }
    }
}

/// Retired signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredKey {
    /// Base64 seed (supports `env:VAR`)
    pub seed: String,
    /// Version tag
    pub version: String,
}

/// Session token issuer (external identity provider)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Expected `iss` claim
    pub issuer: String,
    /// JWKS URL; defaults to `<issuer>/.well-known/jwks.json`
    pub jwks_url: Option<String>,
    /// Accepted audiences; empty accepts any
    pub audiences: Vec<String>,
    /// Clock skew tolerance
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            jwks_url: None,
            audiences: Vec::new(),
            leeway: Duration::from_secs(60),
        }
    }
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Base URL of the edge (JWKS source and cache-bust target)
    pub edge_url: String,
    /// Gateway JWKS URL; defaults to the edge's well-known path
    pub gateway_jwks_url: Option<String>,
    /// Base64 AES-256 key for credentials at rest (supports `env:VAR`)
    pub encryption_key: String,
    /// HMAC secret of OAuth state tokens (supports `env:VAR`)
    pub state_secret: String,
    /// Base64 Ed25519 seed of the API key signer (supports `env:VAR`)
    pub apikey_seed: String,
    /// Version tag of the API key signer (`kid = mcpist-apikey-<version>`)
    pub apikey_key_version: String,
    /// Bearer secret presented to the edge on cache-bust calls (supports `env:VAR`)
    pub internal_secret: String,
    /// Refresh tokens this long before expiry
    #[serde(with = "humantime_serde")]
    pub refresh_buffer: Duration,
    /// Timeout of provider token requests
    #[serde(with = "humantime_serde")]
    pub provider_timeout: Duration,
    /// Freshness window of cached user contexts
    #[serde(with = "humantime_serde")]
    pub context_ttl: Duration,
    /// Plans and their limits
    pub plans: HashMap<String, PlanLimits>,
    /// Module catalog: name to description
    pub modules: BTreeMap<String, String>,
    /// Endpoint overrides of built-in providers
    pub providers: HashMap<String, ProviderOverride>,
    /// Additional provider recipes
    pub recipes: Vec<CustomRecipe>,
    /// Identity-provider subjects that get the admin role on registration
    pub admin_clerk_ids: Vec<String>,
    /// Where the browser lands after the OAuth callback when the flow gave none
    pub oauth_return_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            edge_url: "http://127.0.0.1:8080".to_string(),
            gateway_jwks_url: None,
            encryption_key: String::new(),
            state_secret: String::new(),
            apikey_seed: String::new(),
            apikey_key_version: "v1".to_string(),
            internal_secret: String::new(),
            refresh_buffer: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(10),
            context_ttl: Duration::from_secs(30),
            plans: HashMap::from([
                ("free".to_string(), PlanLimits { daily_limit: 100 }),
                ("pro".to_string(), PlanLimits { daily_limit: 10_000 }),
            ]),
            modules: BTreeMap::new(),
            providers: HashMap::new(),
            recipes: Vec::new(),
            admin_clerk_ids: Vec::new(),
            oauth_return_url: "/".to_string(),
        }
    }
}

/// Endpoint overrides of one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    /// Token endpoint
    pub token_url: Option<String>,
    /// Authorization endpoint
    pub authorize_url: Option<String>,
}

/// Additional provider recipe and the modules that use it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRecipe {
    /// Recipe
    #[serde(flatten)]
    pub recipe: RefreshRecipe,
    /// Modules served by this provider
    pub modules: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCPIST_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` in URL-valued fields
    fn expand_env_vars(&mut self) {
        let edge = &mut self.edge;
        for value in [&mut edge.backend_url, &mut edge.session.issuer] {
            *value = expand_string(value);
        }
        for value in [&mut edge.api_key_jwks_url, &mut edge.session.jwks_url]
            .into_iter()
            .flatten()
        {
            *value = expand_string(value);
        }

        let backend = &mut self.backend;
        for value in [&mut backend.edge_url, &mut backend.oauth_return_url] {
            *value = expand_string(value);
        }
        if let Some(value) = &mut backend.gateway_jwks_url {
            *value = expand_string(value);
        }
        for endpoints in backend.providers.values_mut() {
            for value in [&mut endpoints.token_url, &mut endpoints.authorize_url]
                .into_iter()
                .flatten()
            {
                *value = expand_string(value);
            }
        }
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Resolve a secret value: `env:VAR` reads the variable, anything else is literal.
///
/// # Errors
///
/// Returns [`Error::Config`] if `field` is empty or names an unset variable.
pub fn resolve_secret(field: &str, value: &str) -> Result<String> {
    let resolved = match value.strip_prefix("env:") {
        Some(var) => env::var(var)
            .map_err(|_| Error::Config(format!("{field}: environment variable {var} is not set")))?,
        None => value.to_string(),
    };
    if resolved.trim().is_empty() {
        return Err(Error::Config(format!("{field} is not set")));
    }
    Ok(resolved)
}

/// Expand environment variables in a string; unset variables without a
/// default become empty
fn expand_string(value: &str) -> String {
    ENV_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// `base` with `path` appended, without doubling the slash
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}
