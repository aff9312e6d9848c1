//! Edge gateway
//!
//! The public entry point. Authenticates browser sessions and API keys,
//! mints a short-lived gateway assertion for each authenticated request and
//! forwards it to the backend. Publishes the assertion JWKS.

mod router;
mod session;

pub use router::{EdgeState, create_router};
pub use session::{SessionIdentity, SessionVerifier};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::apikey::{ApiKeyVerifier, BackendStatusClient, RevocationCache};
use crate::config::{Config, join_url, resolve_secret};
use crate::http::shutdown_signal;
use crate::trust::{Ed25519Key, GatewaySigner, JWKS_PATH, JwksCache, gateway_kid};
use crate::{Error, Result};

/// Edge server
pub struct EdgeServer {
    state: Arc<EdgeState>,
    addr: SocketAddr,
    sweep_interval: Duration,
}

impl EdgeServer {
    /// Build the edge from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a secret or the session issuer is missing,
    /// or a key is malformed.
    pub fn new(config: &Config) -> Result<Self> {
        let edge = &config.edge;

        let seed = resolve_secret("edge.signing_seed", &edge.signing_seed)?;
        let key = Ed25519Key::from_base64_seed(&seed, gateway_kid(&edge.key_version))?;
        let mut retired = Vec::with_capacity(edge.retired_keys.len());
        for old in &edge.retired_keys {
            let seed = resolve_secret("edge.retired_keys.seed", &old.seed)?;
            retired.push(Ed25519Key::from_base64_seed(&seed, gateway_kid(&old.version))?.public_jwk());
        }
        let signer = Arc::new(GatewaySigner::new(key).with_retired(retired));

        let internal_secret = resolve_secret("edge.internal_secret", &edge.internal_secret)?;

        let http = reqwest::Client::builder()
            .timeout(config.server.peer_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        let sessions = Arc::new(SessionVerifier::new(edge.session.clone(), http.clone())?);

        let jwks_url = edge
            .api_key_jwks_url
            .clone()
            .unwrap_or_else(|| join_url(&edge.backend_url, JWKS_PATH));
        let api_key_jwks = Arc::new(JwksCache::remote(jwks_url, http.clone()));
        let status = Arc::new(BackendStatusClient::new(
            http.clone(),
            edge.backend_url.clone(),
            Arc::clone(&signer),
        ));
        let api_keys = Arc::new(ApiKeyVerifier::new(
            api_key_jwks,
            RevocationCache::new(edge.revocation_ttl),
            status,
        ));

        let addr: SocketAddr = format!("{}:{}", edge.host, edge.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid edge address: {e}")))?;

        let state = Arc::new(EdgeState {
            signer,
            sessions,
            api_keys,
            http,
            backend_url: edge.backend_url.clone(),
            internal_secret,
            public_paths: edge.public_paths.clone(),
            request_timeout: config.server.request_timeout,
        });

        Ok(Self {
            state,
            addr,
            sweep_interval: edge.revocation_ttl.max(Duration::from_secs(1)),
        })
    }

    /// Shared state
    pub fn state(&self) -> Arc<EdgeState> {
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
            backend = %self.state.backend_url,
            "MCPist edge listening"
        );

        // Expired status entries are never read again; drop them periodically
        let api_keys = Arc::clone(&self.state.api_keys);
        let period = self.sweep_interval;
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                api_keys.cache().evict_expired();
            }
        });

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        sweeper.abort();
        served.map_err(|e| Error::Internal(e.to_string()))?;

        info!("Edge shutdown complete");
        Ok(())
    }
}
