//! Browser session verification
//!
//! Session tokens are JWTs issued by the external identity provider. The
//! edge verifies them against the provider's JWKS through a [`JwksCache`]
//! and only extracts the subject and email; everything else about the user
//! lives in the backend.

use jsonwebtoken::{Algorithm, Validation, jwk::JwkSet};
use serde::Deserialize;

use crate::config::{SessionConfig, join_url};
use crate::trust::JWKS_PATH;
use crate::trust::jwks::{JwksCache, map_jwt_error};
use crate::{Error, Result};

/// Signature algorithms accepted on session tokens
const SESSION_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Identity extracted from a verified session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Identity-provider subject
    pub subject: String,
    /// Email, when the provider includes it
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Identity-provider session verifier
pub struct SessionVerifier {
    config: SessionConfig,
    jwks: JwksCache<JwkSet>,
}

impl SessionVerifier {
    /// Create a verifier fetching keys from the configured provider
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no issuer is configured.
    pub fn new(config: SessionConfig, http: reqwest::Client) -> Result<Self> {
        let jwks = JwksCache::remote(jwks_url(&config), http);
        Self::with_keys(config, jwks)
    }

    /// Create a verifier over an existing key cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no issuer is configured.
    pub fn with_keys(config: SessionConfig, jwks: JwksCache<JwkSet>) -> Result<Self> {
        if config.issuer.trim().is_empty() {
            return Err(Error::Config(
                "edge.session.issuer must be set; session tokens are bound to one issuer".to_string(),
            ));
        }
        Ok(Self { config, jwks })
    }

    /// Verify a session token
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] / [`Error::Expired`] if the token does
    /// not verify, [`Error::Upstream`] if the JWKS cannot be fetched.
    pub async fn verify(&self, token: &str) -> Result<SessionIdentity> {
        let alg = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?.alg;
        let validation = self.validation(alg)?;

        let claims = self
            .jwks
            .verify::<SessionClaims>(token, &validation)
            .await?
            .claims;

        Ok(SessionIdentity {
            subject: claims.sub,
            email: claims.email.filter(|e| !e.is_empty()),
        })
    }

    /// One algorithm per validation: the key family has to match it
    fn validation(&self, alg: Algorithm) -> Result<Validation> {
        if !SESSION_ALGORITHMS.contains(&alg) {
            return Err(Error::InvalidToken(format!("unsupported algorithm {alg:?}")));
        }

        let mut validation = Validation::new(alg);
        validation.leeway = self.config.leeway.as_secs();
        validation.set_issuer(&[self.config.issuer.as_str()]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
            validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        } else {
            validation.set_audience(self.config.audiences.as_slice());
            validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
        }
        Ok(validation)
    }
}

fn jwks_url(config: &SessionConfig) -> String {
    config
        .jwks_url
        .clone()
        .unwrap_or_else(|| join_url(&config.issuer, JWKS_PATH))
}
