//! Trust-class extractors
//!
//! Each backend handler names its trust class by the extractor it takes.
//! All of them read the `X-Gateway-Token` header and go through the
//! [`TrustBridge`](crate::trust::TrustBridge).

use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};

use super::BackendState;
use crate::Error;
use crate::store::User;
use crate::trust::{Caller, GATEWAY_TOKEN_HEADER, GatewayClaims, TrustClass};

/// Caller of an `Internal` route
#[derive(Debug)]
pub struct InternalCaller(pub GatewayClaims);

/// Caller of a `Registration` route
#[derive(Debug)]
pub struct Registrant {
    /// Identity-provider subject
    pub clerk_id: String,
    /// Email
    pub email: String,
}

/// Caller of a `Standard` route
#[derive(Debug)]
pub struct StandardUser(pub User);

/// Caller of an `Admin` route
#[derive(Debug)]
pub struct AdminUser(pub User);

async fn authorize(parts: &Parts, state: &BackendState, class: TrustClass) -> Result<Caller, Error> {
    let token = parts
        .headers
        .get(GATEWAY_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    state.bridge.authorize(token, class).await
}

fn unexpected(class: TrustClass) -> Error {
    Error::Internal(format!("trust bridge returned wrong caller for {class:?}"))
}

impl FromRequestParts<Arc<BackendState>> for InternalCaller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<BackendState>) -> Result<Self, Error> {
        match authorize(parts, state, TrustClass::Internal).await? {
            Caller::Internal(claims) => Ok(Self(claims)),
            _ => Err(unexpected(TrustClass::Internal)),
        }
    }
}

impl FromRequestParts<Arc<BackendState>> for Registrant {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<BackendState>) -> Result<Self, Error> {
        match authorize(parts, state, TrustClass::Registration).await? {
            Caller::Registrant { clerk_id, email } => Ok(Self { clerk_id, email }),
            _ => Err(unexpected(TrustClass::Registration)),
        }
    }
}

impl FromRequestParts<Arc<BackendState>> for StandardUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<BackendState>) -> Result<Self, Error> {
        match authorize(parts, state, TrustClass::Standard).await? {
            Caller::User(user) => Ok(Self(user)),
            _ => Err(unexpected(TrustClass::Standard)),
        }
    }
}

impl FromRequestParts<Arc<BackendState>> for AdminUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<BackendState>) -> Result<Self, Error> {
        match authorize(parts, state, TrustClass::Admin).await? {
            Caller::User(user) => Ok(Self(user)),
            _ => Err(unexpected(TrustClass::Admin)),
        }
    }
}
