//! API key verification (edge side)
//!
//! The signature is checked offline against the backend's JWKS. Whether
//! the key is still active is asked of the backend once and cached for five
//! minutes. If the backend cannot be reached and nothing is cached, the key
//! is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::issuer::{API_KEY_PREFIX, APIKEY_ISSUER, ApiKeyClaims, ApiKeyStatus};
use super::revocation::{KeyState, RevocationCache};
use crate::trust::jwks::eddsa_validation;
use crate::trust::{GATEWAY_TOKEN_HEADER, GatewayIdentity, GatewaySigner, JwksCache};
use crate::{Error, Result};

/// Where the edge asks for key status
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// Status of `key_id` as claimed by `user_id`; `None` if unknown
    async fn key_status(&self, key_id: &str, user_id: &str) -> Result<Option<ApiKeyStatus>>;
}

/// Status source calling the backend's internal endpoint
pub struct BackendStatusClient {
    http: reqwest::Client,
    backend_url: String,
    signer: Arc<GatewaySigner>,
}

impl BackendStatusClient {
    /// Create a client for the backend at `backend_url`
    pub fn new(http: reqwest::Client, backend_url: impl Into<String>, signer: Arc<GatewaySigner>) -> Self {
        Self {
            http,
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            signer,
        }
    }
}

#[async_trait]
impl StatusSource for BackendStatusClient {
    async fn key_status(&self, key_id: &str, user_id: &str) -> Result<Option<ApiKeyStatus>> {
        let assertion = self.signer.mint(&GatewayIdentity::User {
            user_id: user_id.to_string(),
            email: None,
        })?;
        let url = format!("{}/internal/apikeys/{key_id}/status", self.backend_url);

        let response = self
            .http
            .get(&url)
            .header(GATEWAY_TOKEN_HEADER, assertion)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("API key status request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| Error::Upstream(format!("Invalid API key status response: {e}"))),
            status => Err(Error::Upstream(format!("API key status returned HTTP {status}"))),
        }
    }
}

/// Caller authenticated by API key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedApiKey {
    /// Owner user ID
    pub user_id: String,
    /// Key record ID
    pub key_id: String,
}

/// Edge-side API key verifier
pub struct ApiKeyVerifier {
    jwks: Arc<JwksCache>,
    cache: RevocationCache,
    status: Arc<dyn StatusSource>,
}

impl ApiKeyVerifier {
    /// Create a verifier
    pub fn new(jwks: Arc<JwksCache>, cache: RevocationCache, status: Arc<dyn StatusSource>) -> Self {
        Self { jwks, cache, status }
    }

    /// Whether a bearer token looks like an API key
    #[must_use]
    pub fn is_api_key(token: &str) -> bool {
        token.starts_with(API_KEY_PREFIX)
    }

    /// Status cache
    #[must_use]
    pub fn cache(&self) -> &RevocationCache {
        &self.cache
    }

    /// Verify an `mpt_` token.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidToken`] / [`Error::Expired`] if the token does not verify
    /// - [`Error::Unauthorized`] if the key is revoked, unknown, or owned by
    ///   someone other than the token subject
    /// - [`Error::Upstream`] if the status is unknown and the backend is unreachable
    pub async fn verify(&self, token: &str) -> Result<VerifiedApiKey> {
        let jwt = token
            .strip_prefix(API_KEY_PREFIX)
            .ok_or_else(|| Error::InvalidToken("not an API key".to_string()))?;

        let mut validation = eddsa_validation(APIKEY_ISSUER);
        validation.set_required_spec_claims(&["iss", "sub"]);
        let claims = self.jwks.verify::<ApiKeyClaims>(jwt, &validation).await?.claims;

        let state = match self.cache.get(&claims.kid) {
            Some(state) => state,
            None => self.fetch_state(&claims).await?,
        };

        if !state.active {
            debug!(key_id = %claims.kid, "Rejected inactive API key");
            return Err(Error::Unauthorized("API key is revoked or unknown".to_string()));
        }
        if state.user_id.as_deref() != Some(claims.sub.as_str()) {
            warn!(key_id = %claims.kid, "API key subject does not match key owner");
            return Err(Error::Unauthorized("API key owner mismatch".to_string()));
        }

        Ok(VerifiedApiKey {
            user_id: claims.sub,
            key_id: claims.kid,
        })
    }

    async fn fetch_state(&self, claims: &ApiKeyClaims) -> Result<KeyState> {
        let status = self
            .status
            .key_status(&claims.kid, &claims.sub)
            .await
            .inspect_err(|e| {
                warn!(key_id = %claims.kid, error = %e, "API key status unavailable, rejecting");
            })?;

        let state = match status {
            Some(status) => KeyState {
                active: status.active,
                user_id: Some(status.user_id),
            },
            None => KeyState {
                active: false,
                user_id: None,
            },
        };
        self.cache.set(&claims.kid, state.clone());
        Ok(state)
    }
}
