//! Edge to backend trust
//!
//! - [`keys`]: Ed25519 keys and their public JWK form
//! - [`jwks`]: cached key sets with refetch on unknown `kid`
//! - [`assertion`]: 30-second gateway assertions minted by the edge
//! - [`bridge`]: per-route trust classes on the backend

pub mod assertion;
pub mod bridge;
pub mod jwks;
pub mod keys;

pub use assertion::{
    ASSERTION_TTL, GATEWAY_ISSUER, GATEWAY_TOKEN_HEADER, GatewayClaims, GatewayIdentity,
    GatewaySigner, GatewayVerifier,
};
pub use bridge::{Caller, TrustBridge, TrustClass};
pub use jwks::{JWKS_PATH, JwksCache, KeySet};
pub use keys::{Ed25519Key, Jwk, JwkSet, apikey_kid, gateway_kid};
