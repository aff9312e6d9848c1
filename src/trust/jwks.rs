//! JWKS cache and JWT verification
//!
//! The verifying side of both trust paths (gateway assertions on the
//! backend, API keys on the edge) holds one [`JwksCache`] pointed at the
//! signer's `/.well-known/jwks.json`; the edge holds another for the
//! identity provider's session keys. A fetched set is cached for an hour.
//! A token signed with an unknown `kid` triggers one refetch before it is
//! rejected, so key rotation does not need coordinated restarts. After a
//! refetch that still misses, further unknown kids are rejected without
//! fetching until the refetch cooldown has passed.

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::AlgorithmParameters;
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::keys::JwkSet;
use crate::{Error, Result};

/// How long a fetched key set is trusted
pub const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Minimum spacing of refetches triggered by unknown key IDs
pub const REFETCH_COOLDOWN: Duration = Duration::from_secs(10);

/// Well-known path of a JWKS document
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// A JWKS document shape a [`JwksCache`] can hold
pub trait KeySet: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Whether a key with `kid` is present
    fn contains(&self, kid: &str) -> bool;

    /// Decoding key for `kid`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the key is absent or unusable.
    fn decoding_key(&self, kid: &str) -> Result<DecodingKey>;
}

/// Ed25519 keys published by our own signers
impl KeySet for JwkSet {
    fn contains(&self, kid: &str) -> bool {
        self.find(kid).is_some()
    }

    fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        self.find(kid).ok_or_else(|| unknown_kid(kid))?.decoding_key()
    }
}

/// Third-party keys (RSA, EC, OKP) such as an identity provider's
impl KeySet for jsonwebtoken::jwk::JwkSet {
    fn contains(&self, kid: &str) -> bool {
        self.find(kid).is_some()
    }

    fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let jwk = self.find(kid).ok_or_else(|| unknown_kid(kid))?;
        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            return Err(Error::InvalidToken(format!("symmetric key {kid} not accepted")));
        }
        DecodingKey::from_jwk(jwk).map_err(|e| Error::InvalidToken(format!("invalid key {kid}: {e}")))
    }
}

fn unknown_kid(kid: &str) -> Error {
    Error::InvalidToken(format!("unknown key ID {kid}"))
}

enum Source {
    Remote { url: String, http: reqwest::Client },
    Static,
}

struct CachedJwks<S> {
    keys: S,
    fetched_at: Instant,
}

/// Cached public key set of one signer
pub struct JwksCache<S = JwkSet> {
    source: Source,
    cached: RwLock<Option<CachedJwks<S>>>,
    /// Serializes refetches so a burst of unknown kids causes one request
    refresh: tokio::sync::Mutex<()>,
    /// When a refetch last failed to produce the requested kid
    missed_at: Mutex<Option<Instant>>,
    ttl: Duration,
    refetch_cooldown: Duration,
}

impl<S: KeySet> JwksCache<S> {
    /// Cache that fetches from `url`
    pub fn remote(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            source: Source::Remote {
                url: url.into(),
                http,
            },
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
            missed_at: Mutex::new(None),
            ttl: JWKS_TTL,
            refetch_cooldown: REFETCH_COOLDOWN,
        }
    }

    /// Cache with a fixed key set that never refetches
    #[must_use]
    pub fn from_static(keys: S) -> Self {
        Self {
            source: Source::Static,
            cached: RwLock::new(Some(CachedJwks {
                keys,
                fetched_at: Instant::now(),
            })),
            refresh: tokio::sync::Mutex::new(()),
            missed_at: Mutex::new(None),
            ttl: Duration::MAX,
            refetch_cooldown: REFETCH_COOLDOWN,
        }
    }

    /// Override the cache lifetime
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the spacing of unknown-kid refetches
    #[must_use]
    pub fn with_refetch_cooldown(mut self, cooldown: Duration) -> Self {
        self.refetch_cooldown = cooldown;
        self
    }

    /// Current key set, fetching if nothing fresh is cached
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upstream`] if the fetch fails.
    pub async fn keys(&self) -> Result<S> {
        if let Some(keys) = self.fresh() {
            return Ok(keys);
        }
        self.refetch().await
    }

    /// Decoding key for `kid`, refetching once if it is unknown
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if the key is still unknown after a
    /// refetch (or a refetch is cooling down), [`Error::Upstream`] if the
    /// fetch fails.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let keys = self.keys().await?;
        if keys.contains(kid) {
            return keys.decoding_key(kid);
        }

        if self.cooling_down() {
            debug!(kid = %kid, "Unknown key ID inside refetch cooldown");
            return Err(unknown_kid(kid));
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let keys = self.refetch().await?;
        if !keys.contains(kid) {
            *self.missed_at.lock() = Some(Instant::now());
            return Err(unknown_kid(kid));
        }
        keys.decoding_key(kid)
    }

    /// Verify a JWT and decode its claims.
    ///
    /// The header algorithm must be one `validation` allows; otherwise the
    /// token is rejected before a key is looked up. The key is selected by
    /// the `kid` of the token header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] or [`Error::Expired`] on verification
    /// failure, [`Error::Upstream`] if the key set cannot be fetched.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str, validation: &Validation) -> Result<TokenData<T>> {
        let header = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?;
        if !validation.algorithms.contains(&header.alg) {
            return Err(Error::InvalidToken(format!("unexpected algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::InvalidToken("missing kid".to_string()))?;

        let key = self.decoding_key(&kid).await?;
        jsonwebtoken::decode::<T>(token, &key, validation).map_err(map_jwt_error)
    }

    fn cooling_down(&self) -> bool {
        self.missed_at
            .lock()
            .is_some_and(|at| at.elapsed() < self.refetch_cooldown)
    }

    fn fresh(&self) -> Option<S> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.keys.clone())
    }

    async fn refetch(&self) -> Result<S> {
        let Source::Remote { url, http } = &self.source else {
            return self
                .cached
                .read()
                .as_ref()
                .map(|c| c.keys.clone())
                .ok_or_else(|| Error::Internal("static key set is empty".to_string()));
        };

        let before = self.cached.read().as_ref().map(|c| c.fetched_at);
        let _guard = self.refresh.lock().await;

        // Someone else refetched while we waited
        let after = self.cached.read().as_ref().map(|c| c.fetched_at);
        if after.is_some() && after != before {
            if let Some(keys) = self.cached.read().as_ref().map(|c| c.keys.clone()) {
                return Ok(keys);
            }
        }

        debug!(url = %url, "Fetching JWKS");
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("JWKS fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "JWKS fetch returned HTTP {}",
                response.status()
            )));
        }
        let keys: S = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Invalid JWKS document: {e}")))?;

        *self.cached.write() = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

/// Map a `jsonwebtoken` failure onto the crate error
pub(crate) fn map_jwt_error(e: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind;

    match e.kind() {
        ErrorKind::ExpiredSignature => Error::Expired(e.to_string()),
        _ => Error::InvalidToken(e.to_string()),
    }
}

/// Strict EdDSA validation for `issuer` with no clock leeway
#[must_use]
pub fn eddsa_validation(issuer: &str) -> Validation {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.set_issuer(&[issuer]);
    validation.validate_aud = false;
    validation.leeway = 0;
    validation
}
