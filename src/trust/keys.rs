//! Ed25519 signing keys and their JWK form
//!
//! Keys are built from a 32-byte seed. Only the public half is ever
//! serialized; the seed is wiped once the PKCS#8 encoding key is derived.

use base64::{Engine as _, engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Length of an Ed25519 seed
pub const SEED_LEN: usize = 32;

/// Key ID of a gateway signing key version
#[must_use]
pub fn gateway_kid(version: &str) -> String {
    format!("mcpist-gateway-{version}")
}

/// Key ID of an API-key signing key version
#[must_use]
pub fn apikey_kid(version: &str) -> String {
    format!("mcpist-apikey-{version}")
}

/// Ed25519 signing key with its key ID
pub struct Ed25519Key {
    kid: String,
    encoding: EncodingKey,
    public: [u8; SEED_LEN],
}

impl std::fmt::Debug for Ed25519Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Key")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl Ed25519Key {
    /// Build a key from a raw 32-byte seed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the seed has the wrong length.
    pub fn from_seed(seed: &[u8], kid: impl Into<String>) -> Result<Self> {
        let seed: Zeroizing<[u8; SEED_LEN]> = Zeroizing::new(seed.try_into().map_err(|_| {
            Error::Config(format!(
                "Signing seed must be {SEED_LEN} bytes, got {} bytes",
                seed.len()
            ))
        })?);

        let signing = SigningKey::from_bytes(&seed);
        let der = signing
            .to_pkcs8_der()
            .map_err(|e| Error::Config(format!("Failed to encode signing key: {e}")))?;

        Ok(Self {
            kid: kid.into(),
            encoding: EncodingKey::from_ed_der(der.as_bytes()),
            public: signing.verifying_key().to_bytes(),
        })
    }

    /// Build a key from a base64-encoded seed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the seed is empty, not base64, or the wrong length.
    pub fn from_base64_seed(seed: &str, kid: impl Into<String>) -> Result<Self> {
        if seed.trim().is_empty() {
            return Err(Error::Config("Signing seed is not set".to_string()));
        }
        let raw = Zeroizing::new(
            STANDARD
                .decode(seed.trim())
                .map_err(|e| Error::Config(format!("Signing seed is not valid base64: {e}")))?,
        );
        Self::from_seed(&raw, kid)
    }

    /// Key ID
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Encoding key for `jsonwebtoken`
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    /// Public key as a JWK
    #[must_use]
    pub fn public_jwk(&self) -> Jwk {
        Jwk::ed25519(&self.kid, &self.public)
    }
}

/// Public Ed25519 key in JWK form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `OKP`
    pub kty: String,
    /// Curve, always `Ed25519`
    pub crv: String,
    /// base64url public key
    pub x: String,
    /// Key ID
    pub kid: String,
    /// Intended use
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// Algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl Jwk {
    /// JWK for an Ed25519 public key
    #[must_use]
    pub fn ed25519(kid: &str, public: &[u8; SEED_LEN]) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(public),
            kid: kid.to_string(),
            key_use: Some("sig".to_string()),
            alg: Some("EdDSA".to_string()),
        }
    }

    /// Decoding key for `jsonwebtoken`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToken`] if this is not an Ed25519 key.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        if self.kty != "OKP" || self.crv != "Ed25519" {
            return Err(Error::InvalidToken(format!(
                "key {} is {}/{}, expected OKP/Ed25519",
                self.kid, self.kty, self.crv
            )));
        }
        DecodingKey::from_ed_components(&self.x)
            .map_err(|e| Error::InvalidToken(format!("invalid key {}: {e}", self.kid)))
    }
}

/// JSON Web Key Set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Keys
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Find a key by ID
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwk_shape() {
        let key = Ed25519Key::from_seed(&[1u8; 32], gateway_kid("v1")).unwrap();
        let jwk = serde_json::to_value(key.public_jwk()).unwrap();
        assert_eq!(jwk["kty"], "OKP");
        assert_eq!(jwk["crv"], "Ed25519");
        assert_eq!(jwk["kid"], "mcpist-gateway-v1");
        assert_eq!(jwk["use"], "sig");
        assert_eq!(jwk["alg"], "EdDSA");
        // 32 bytes base64url without padding
        assert_eq!(jwk["x"].as_str().unwrap().len(), 43);
        assert!(jwk.get("d").is_none());
    }

    #[test]
    fn same_seed_same_public_key() {
        let a = Ed25519Key::from_seed(&[9u8; 32], "a").unwrap();
        let b = Ed25519Key::from_seed(&[9u8; 32], "a").unwrap();
        assert_eq!(a.public_jwk(), b.public_jwk());
        assert!(a.public_jwk().decoding_key().is_ok());
    }

    #[test]
    fn seed_length_is_validated() {
        assert!(matches!(Ed25519Key::from_seed(&[0u8; 16], "k"), Err(Error::Config(_))));
        assert!(matches!(Ed25519Key::from_base64_seed("", "k"), Err(Error::Config(_))));
        assert!(Ed25519Key::from_base64_seed(&STANDARD.encode([4u8; 32]), "k").is_ok());
    }

    #[test]
    fn non_ed25519_jwk_is_rejected() {
        let mut jwk = Ed25519Key::from_seed(&[1u8; 32], "k").unwrap().public_jwk();
        jwk.kty = "RSA".to_string();
        assert!(jwk.decoding_key().is_err());
    }
}
