//! Signed OAuth `state` parameter
//!
//! The connect flow round-trips a state token through the provider. It binds
//! the callback to the user and module that started it:
//!
//! ```text
//! base64url(JSON{service, user_id, return_to?, iat}) "." base64url(HMAC-SHA256(secret, first segment))
//! ```
//!
//! The MAC is computed over the received first segment, never over a
//! re-serialization, and compared in constant time.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a state token
pub const STATE_MAX_AGE: Duration = Duration::from_secs(600);

/// What the state token carries through the provider redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    /// Module being connected
    pub service: String,
    /// User who started the flow
    pub user_id: String,
    /// Where to send the browser afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SignedState {
    #[serde(flatten)]
    payload: StatePayload,
    iat: i64,
}

/// HMAC signer for OAuth state tokens
pub struct StateSigner {
    secret: Zeroizing<Vec<u8>>,
    max_age: Duration,
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl StateSigner {
    /// Create a signer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is empty.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("OAuth state secret is not set".to_string()));
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
            max_age: STATE_MAX_AGE,
        })
    }

    /// Sign a payload issued now
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn generate_state(&self, payload: &StatePayload) -> Result<String> {
        self.generate_state_at(payload, Utc::now().timestamp())
    }

    /// Sign a payload with an explicit issue time
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn generate_state_at(&self, payload: &StatePayload, iat: i64) -> Result<String> {
        let body = serde_json::to_vec(&SignedState {
            payload: payload.clone(),
            iat,
        })?;
        let encoded = URL_SAFE_NO_PAD.encode(body);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(encoded.as_bytes())?);
        Ok(format!("{encoded}.{signature}"))
    }

    /// Verify a state token against the current time
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidToken`] if the token is malformed or the MAC does not match
    /// - [`Error::Expired`] if the token is older than the maximum age
    pub fn verify_state(&self, token: &str) -> Result<StatePayload> {
        self.verify_state_at(token, Utc::now().timestamp())
    }

    /// Verify a state token against an explicit time
    ///
    /// # Errors
    ///
    /// See [`StateSigner::verify_state`].
    pub fn verify_state_at(&self, token: &str, now: i64) -> Result<StatePayload> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::InvalidToken("malformed state".to_string()))?;

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::InvalidToken("malformed state signature".to_string()))?;
        let expected = self.mac(encoded.as_bytes())?;
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(Error::InvalidToken("state signature mismatch".to_string()));
        }

        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::InvalidToken("malformed state payload".to_string()))?;
        let signed: SignedState = serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidToken(format!("malformed state payload: {e}")))?;

        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(signed.iat) > max_age {
            return Err(Error::Expired("state".to_string()));
        }

        Ok(signed.payload)
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as hmac::digest::KeyInit>::new_from_slice(&self.secret)
            .map_err(|e| Error::Config(format!("Invalid state secret: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
