//! Gateway assertions
//!
//! The edge mints a fresh assertion for every request it forwards. It is an
//! EdDSA JWT living 30 seconds that names either the internal user ID or,
//! for callers not yet registered, the identity-provider subject. The
//! backend never shares a session with the edge; this token is the whole
//! trust relationship.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};

use super::jwks::{JwksCache, eddsa_validation};
use super::keys::{Ed25519Key, Jwk, JwkSet};
use crate::{Error, Result};

/// Issuer of gateway assertions
pub const GATEWAY_ISSUER: &str = "mcpist-gateway";

/// Lifetime of a gateway assertion
pub const ASSERTION_TTL: Duration = Duration::from_secs(30);

/// Header carrying the assertion from edge to backend
pub const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";

/// Claims of a gateway assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayClaims {
    /// Internal user ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Identity-provider subject, for callers without an internal user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clerk_id: Option<String>,
    /// Email, when the identity provider supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
}

/// Who the edge vouches for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayIdentity {
    /// Caller with an internal user (API-key callers, registered users)
    User {
        /// Internal user ID
        user_id: String,
        /// Email
        email: Option<String>,
    },
    /// Caller known only by identity-provider subject
    Clerk {
        /// Identity-provider subject
        clerk_id: String,
        /// Email
        email: Option<String>,
    },
}

/// Edge-side assertion signer
pub struct GatewaySigner {
    key: Ed25519Key,
    retired: Vec<Jwk>,
    ttl: Duration,
}

impl GatewaySigner {
    /// Create a signer for the current key
    #[must_use]
    pub fn new(key: Ed25519Key) -> Self {
        Self {
            key,
            retired: Vec::new(),
            ttl: ASSERTION_TTL,
        }
    }

    /// Keep publishing retired public keys so in-flight assertions verify
    #[must_use]
    pub fn with_retired(mut self, retired: Vec<Jwk>) -> Self {
        self.retired = retired;
        self
    }

    /// Mint an assertion issued now
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if signing fails.
    pub fn mint(&self, identity: &GatewayIdentity) -> Result<String> {
        self.mint_at(identity, Utc::now().timestamp())
    }

    /// Mint an assertion with an explicit issue time
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if signing fails.
    pub fn mint_at(&self, identity: &GatewayIdentity, iat: i64) -> Result<String> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let (user_id, clerk_id, email) = match identity {
            GatewayIdentity::User { user_id, email } => (Some(user_id.clone()), None, email.clone()),
            GatewayIdentity::Clerk { clerk_id, email } => (None, Some(clerk_id.clone()), email.clone()),
        };
        let claims = GatewayClaims {
            user_id,
            clerk_id,
            email,
            iss: GATEWAY_ISSUER.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.key.kid().to_string());
        jsonwebtoken::encode(&header, &claims, self.key.encoding_key())
            .map_err(|e| Error::Crypto(format!("Failed to sign gateway assertion: {e}")))
    }

    /// Public keys to publish: current first, then retired
    #[must_use]
    pub fn jwks(&self) -> JwkSet {
        let mut keys = vec![self.key.public_jwk()];
        keys.extend(self.retired.iter().cloned());
        JwkSet { keys }
    }
}

/// Backend-side assertion verifier
pub struct GatewayVerifier {
    jwks: Arc<JwksCache>,
    ttl: Duration,
}

impl GatewayVerifier {
    /// Create a verifier over the edge's key set
    #[must_use]
    pub fn new(jwks: Arc<JwksCache>) -> Self {
        Self {
            jwks,
            ttl: ASSERTION_TTL,
        }
    }

    /// Verify an assertion.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidToken`] on a bad signature, algorithm, issuer,
    ///   unknown key, or when not exactly one of `user_id`/`clerk_id` is set
    /// - [`Error::Expired`] when expired or issued more than 30 s ago
    pub async fn verify(&self, token: &str) -> Result<GatewayClaims> {
        let mut validation = eddsa_validation(GATEWAY_ISSUER);
        validation.set_required_spec_claims(&["exp", "iat", "iss"]);

        let claims = self
            .jwks
            .verify::<GatewayClaims>(token, &validation)
            .await?
            .claims;

        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let age = Utc::now().timestamp().saturating_sub(claims.iat);
        if age > ttl {
            return Err(Error::Expired(format!("gateway assertion is {age}s old")));
        }

        match (&claims.user_id, &claims.clerk_id) {
            (Some(_), None) | (None, Some(_)) => Ok(claims),
            _ => Err(Error::InvalidToken(
                "assertion must carry exactly one of user_id or clerk_id".to_string(),
            )),
        }
    }
}
