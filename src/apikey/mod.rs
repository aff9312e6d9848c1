//! Long-lived API keys
//!
//! The backend issues and revokes keys ([`ApiKeyIssuer`]); the edge
//! verifies them ([`ApiKeyVerifier`]) with a short-lived status cache
//! ([`RevocationCache`]) that the backend can bust on revocation.

mod issuer;
mod revocation;
mod verifier;

pub use issuer::{
    API_KEY_PREFIX, APIKEY_ISSUER, ApiKeyClaims, ApiKeyIssuer, ApiKeyStatus, IssuedApiKey,
    RevocationNotifier,
};
pub use revocation::{KeyState, REVOCATION_TTL, RevocationCache};
pub use verifier::{ApiKeyVerifier, BackendStatusClient, StatusSource, VerifiedApiKey};
