//! API key issuance (backend side)
//!
//! An API key is `mpt_` followed by an EdDSA JWT signed with the backend's
//! own key. The JWT names the owner (`sub`) and the key record (`kid`
//! claim), so the edge can verify it offline and only asks the backend
//! whether the record is still active.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{ApiKeyRecord, ApiKeyStore};
use crate::trust::{Ed25519Key, JwkSet};
use crate::{Error, Result};

/// Prefix that marks a bearer token as an API key
pub const API_KEY_PREFIX: &str = "mpt_";

/// Issuer of API key tokens
pub const APIKEY_ISSUER: &str = "mcpist-api";

/// Claims of an API key token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyClaims {
    /// Owner user ID
    pub sub: String,
    /// Key record ID
    pub kid: String,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds); keys without expiry live until revoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Answer of the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyStatus {
    /// Whether the key may be used
    pub active: bool,
    /// Key record ID
    pub key_id: String,
    /// Owner user ID
    pub user_id: String,
    /// Expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Freshly issued key; the token is shown to the user once
#[derive(Debug, Clone, Serialize)]
pub struct IssuedApiKey {
    /// The `mpt_` token
    pub token: String,
    /// Stored record
    #[serde(flatten)]
    pub record: ApiKeyRecord,
}

/// Told when a key is revoked so caches elsewhere can drop it
#[async_trait]
pub trait RevocationNotifier: Send + Sync + 'static {
    /// Key `key_id` was revoked
    async fn key_revoked(&self, key_id: &str) -> Result<()>;
}

/// Backend-side API key authority
pub struct ApiKeyIssuer {
    key: Ed25519Key,
    store: Arc<dyn ApiKeyStore>,
    notifier: Option<Arc<dyn RevocationNotifier>>,
}

impl ApiKeyIssuer {
    /// Create an issuer
    pub fn new(key: Ed25519Key, store: Arc<dyn ApiKeyStore>) -> Self {
        Self {
            key,
            store,
            notifier: None,
        }
    }

    /// Notify `notifier` after every revocation
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn RevocationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Issue a key for a user
    ///
    /// # Errors
    ///
    /// Returns an error if signing or the store fails.
    pub async fn issue(&self, user_id: &str, name: &str, ttl: Option<Duration>) -> Result<IssuedApiKey> {
        let now = Utc::now().timestamp();
        let expires_at = ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)));
        let key_id = uuid::Uuid::new_v4().to_string();

        let claims = ApiKeyClaims {
            sub: user_id.to_string(),
            kid: key_id.clone(),
            iss: APIKEY_ISSUER.to_string(),
            iat: now,
            exp: expires_at,
        };
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.key.kid().to_string());
        let jwt = jsonwebtoken::encode(&header, &claims, self.key.encoding_key())
            .map_err(|e| Error::Crypto(format!("Failed to sign API key: {e}")))?;

        let record = ApiKeyRecord {
            key_id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            created_at: now,
            expires_at,
            revoked: false,
        };
        self.store.insert_api_key(record.clone()).await?;

        info!(user_id = %user_id, key_id = %record.key_id, "Issued API key");
        Ok(IssuedApiKey {
            token: format!("{API_KEY_PREFIX}{jwt}"),
            record,
        })
    }

    /// Current status of a key, `None` if it was never issued
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status(&self, key_id: &str) -> Result<Option<ApiKeyStatus>> {
        let Some(record) = self.store.get_api_key(key_id).await? else {
            return Ok(None);
        };
        let now = Utc::now().timestamp();
        let expired = record.expires_at.is_some_and(|exp| now >= exp);
        Ok(Some(ApiKeyStatus {
            active: !record.revoked && !expired,
            key_id: record.key_id,
            user_id: record.user_id,
            expires_at: record.expires_at,
        }))
    }

    /// Revoke one of the user's keys and bust edge caches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key does not exist or belongs to
    /// someone else, or the store error.
    pub async fn revoke(&self, user_id: &str, key_id: &str) -> Result<()> {
        let owned = self
            .store
            .get_api_key(key_id)
            .await?
            .is_some_and(|record| record.user_id == user_id);
        if !owned {
            return Err(Error::NotFound(format!("API key {key_id}")));
        }

        self.store.revoke_api_key(key_id).await?;
        info!(user_id = %user_id, key_id = %key_id, "Revoked API key");

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.key_revoked(key_id).await {
                // The edge cache entry ages out within its TTL anyway
                warn!(key_id = %key_id, error = %e, "Failed to notify edge of revocation");
            }
        }
        Ok(())
    }

    /// Keys owned by a user
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>> {
        self.store.list_api_keys(user_id).await
    }

    /// Public keys that verify API key tokens
    #[must_use]
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![self.key.public_jwk()],
        }
    }
}
