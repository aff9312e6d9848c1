//! Encrypting facade over the credential and OAuth app stores
//!
//! Nothing below this layer ever sees plaintext: credentials are serialized
//! to JSON and sealed with the [`Cipher`] before they reach a store, and
//! OAuth client secrets are sealed the same way.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::Result;
use crate::cipher::Cipher;
use crate::credential::Credential;
use crate::store::{CredentialStore, OAuthAppStore, StoredOAuthApp};

/// Decrypted OAuth application credentials for one provider
#[derive(Clone, PartialEq, Eq)]
pub struct AppCredentials {
    /// Client ID
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Whether the app may be used
    pub enabled: bool,
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Credential vault
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Cipher,
    credentials: Arc<dyn CredentialStore>,
    apps: Arc<dyn OAuthAppStore>,
}

impl CredentialVault {
    /// Create a vault over the given stores
    pub fn new(cipher: Cipher, credentials: Arc<dyn CredentialStore>, apps: Arc<dyn OAuthAppStore>) -> Self {
        Self {
            cipher,
            credentials,
            apps,
        }
    }

    /// Fetch and decrypt a credential
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the blob does not decrypt.
    pub async fn get(&self, user_id: &str, module: &str) -> Result<Option<Credential>> {
        let Some(blob) = self.credentials.get(user_id, module).await? else {
            return Ok(None);
        };
        let json = Zeroizing::new(self.cipher.decrypt(&blob)?);
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Encrypt and store a credential, replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the store fails.
    pub async fn put(&self, user_id: &str, module: &str, credential: &Credential) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_string(credential)?);
        let blob = self.cipher.encrypt(&json)?;
        self.credentials.upsert(user_id, module, blob).await
    }

    /// Delete a credential. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn delete(&self, user_id: &str, module: &str) -> Result<bool> {
        self.credentials.delete(user_id, module).await
    }

    /// Modules the user has credentials for
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn connected_modules(&self, user_id: &str) -> Result<Vec<String>> {
        self.credentials.list_modules(user_id).await
    }

    /// Fetch and decrypt the OAuth app of a provider
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the secret does not decrypt.
    pub async fn app_credentials(&self, provider: &str) -> Result<Option<AppCredentials>> {
        let Some(app) = self.apps.get_app(provider).await? else {
            return Ok(None);
        };
        Ok(Some(AppCredentials {
            client_secret: self.cipher.decrypt(&app.client_secret_encrypted)?,
            client_id: app.client_id,
            redirect_uri: app.redirect_uri,
            enabled: app.enabled,
        }))
    }

    /// Encrypt and store the OAuth app of a provider
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or the store fails.
    pub async fn put_app(&self, provider: &str, app: &AppCredentials) -> Result<()> {
        let stored = StoredOAuthApp {
            client_id: app.client_id.clone(),
            client_secret_encrypted: self.cipher.encrypt(&app.client_secret)?,
            redirect_uri: app.redirect_uri.clone(),
            enabled: app.enabled,
        };
        self.apps.upsert_app(provider, stored).await
    }
}
