//! Credential cipher
//!
//! Versioned AES-256-GCM encryption for credential blobs at rest.
//!
//! Format: `v1:` + base64(nonce ‖ ciphertext ‖ tag). The nonce is 12 random
//! bytes generated per call; the 16-byte tag is appended by the AEAD. The
//! version prefix leaves room for a future key-rotation scheme without
//! breaking rows written today.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Prefix of the only ciphertext version this build writes and reads
const V1_PREFIX: &str = "v1:";

/// Authenticated cipher for credential blobs
#[derive(Clone)]
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Create a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is not exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::Config(format!(
                "Encryption key must be {KEY_SIZE} bytes (256 bits), got {} bytes",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Config(format!("Failed to create cipher: {e}")))?;

        Ok(Self { cipher })
    }

    /// Create a cipher from a base64-encoded key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key is empty, not base64, or the wrong length.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        if key_base64.trim().is_empty() {
            return Err(Error::Config("Encryption key is not set".to_string()));
        }

        let key = Zeroizing::new(
            BASE64
                .decode(key_base64.trim())
                .map_err(|e| Error::Config(format!("Encryption key is not valid base64: {e}")))?,
        );

        Self::new(&key)
    }

    /// Encrypt a plaintext string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the AEAD rejects the input (only possible
    /// for inputs beyond the GCM length limit).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(format!("{V1_PREFIX}{}", BASE64.encode(blob)))
    }

    /// Decrypt a string produced by [`Cipher::encrypt`].
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedVersion`] if the version prefix is missing or unknown
    /// - [`Error::Crypto`] if the payload is malformed, too short, or fails authentication
    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let Some(encoded) = ciphertext.strip_prefix(V1_PREFIX) else {
            let version = ciphertext.split_once(':').map_or("none", |(v, _)| v);
            return Err(Error::UnsupportedVersion(version.to_string()));
        };

        let blob = BASE64
            .decode(encoded)
            .map_err(|_| Error::Crypto("ciphertext is not valid base64".to_string()))?;

        if blob.len() < NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "ciphertext too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce, sealed) = blob.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| Error::Crypto("authentication failed".to_string()))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::Crypto("decrypted data is not valid UTF-8".to_string()))
    }
}

/// Generate 32 random bytes suitable for an encryption key, signing seed or
/// HMAC secret.
#[must_use]
pub fn generate_key() -> [u8; KEY_SIZE] {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(&[7u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn roundtrip_preserves_plaintext() {
        let cipher = cipher();
        for plaintext in ["", "x", "my-secret-access-token-12345", "ünïcødé 🔑"] {
            let sealed = cipher.encrypt(plaintext).unwrap();
            assert!(sealed.starts_with("v1:"));
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryptions_of_same_plaintext_differ() {
        let cipher = cipher();
        let a = cipher.encrypt("same-plaintext").unwrap();
        let b = cipher.encrypt("same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn flipping_any_byte_fails_authentication() {
        let cipher = cipher();
        let sealed = cipher.encrypt("secret").unwrap();
        let blob = BASE64.decode(sealed.strip_prefix("v1:").unwrap()).unwrap();

        // Every byte after the nonce belongs to ciphertext or tag
        for i in NONCE_SIZE..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            let token = format!("v1:{}", BASE64.encode(&tampered));
            assert!(
                matches!(cipher.decrypt(&token), Err(Error::Crypto(_))),
                "byte {i} flip was not detected"
            );
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = cipher().encrypt("secret").unwrap();
        let other = Cipher::new(&[8u8; KEY_SIZE]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_short_payload() {
        let token = format!("v1:{}", BASE64.encode([0u8; NONCE_SIZE - 1]));
        assert!(matches!(cipher().decrypt(&token), Err(Error::Crypto(_))));
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(
            cipher().decrypt("v2:AAAA"),
            Err(Error::UnsupportedVersion(v)) if v == "v2"
        ));
        assert!(matches!(
            cipher().decrypt("plaintext"),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn key_length_is_validated() {
        assert!(matches!(Cipher::new(&[0u8; 16]), Err(Error::Config(_))));
        assert!(matches!(Cipher::new(&[0u8; 64]), Err(Error::Config(_))));
        assert!(matches!(Cipher::from_base64(""), Err(Error::Config(_))));
        assert!(matches!(
            Cipher::from_base64("not-valid-base64!@#$"),
            Err(Error::Config(_))
        ));
        assert!(Cipher::from_base64(&BASE64.encode([0u8; KEY_SIZE])).is_ok());
    }

    #[test]
    fn generated_keys_are_random() {
        assert_ne!(generate_key(), generate_key());
    }
}
