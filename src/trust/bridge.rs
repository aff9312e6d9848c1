//! Trust bridge
//!
//! Every backend route declares a [`TrustClass`]. The bridge verifies the
//! gateway assertion and resolves the caller the class needs.

use std::sync::Arc;

use tracing::debug;

use super::assertion::{GatewayClaims, GatewayVerifier};
use crate::store::{Role, User, UserStore};
use crate::{Error, Result};

/// What a route requires of its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustClass {
    /// Service-to-service call from the edge; no user resolution
    Internal,
    /// First contact of a new user; needs identity-provider subject and email
    Registration,
    /// Regular user route; caller must resolve to an internal user
    Standard,
    /// Standard resolution plus the admin role
    Admin,
}

/// Authorized caller of a backend route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// The edge itself
    Internal(GatewayClaims),
    /// A user about to register
    Registrant {
        /// Identity-provider subject
        clerk_id: String,
        /// Email
        email: String,
    },
    /// A resolved internal user
    User(User),
}

/// Backend-side trust bridge
pub struct TrustBridge {
    verifier: GatewayVerifier,
    users: Arc<dyn UserStore>,
}

impl TrustBridge {
    /// Create a bridge
    pub fn new(verifier: GatewayVerifier, users: Arc<dyn UserStore>) -> Self {
        Self { verifier, users }
    }

    /// Verify an assertion and resolve the caller for `class`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if no assertion was presented
    /// - verification errors of [`GatewayVerifier::verify`]
    /// - [`Error::Unauthorized`] if a registration lacks subject or email
    /// - [`Error::UserNotFound`] if a standard caller does not resolve
    /// - [`Error::Forbidden`] if an admin route is called by a non-admin
    pub async fn authorize(&self, token: Option<&str>, class: TrustClass) -> Result<Caller> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing gateway assertion".to_string()))?;
        let claims = self.verifier.verify(token).await?;

        match class {
            TrustClass::Internal => Ok(Caller::Internal(claims)),
            TrustClass::Registration => {
                let (Some(clerk_id), Some(email)) = (claims.clerk_id, claims.email) else {
                    return Err(Error::Unauthorized(
                        "registration requires identity subject and email".to_string(),
                    ));
                };
                Ok(Caller::Registrant { clerk_id, email })
            }
            TrustClass::Standard => self.resolve(&claims).await.map(Caller::User),
            TrustClass::Admin => {
                let user = self.resolve(&claims).await?;
                if user.role != Role::Admin {
                    debug!(user_id = %user.id, "Admin route refused");
                    return Err(Error::Forbidden("admin role required".to_string()));
                }
                Ok(Caller::User(user))
            }
        }
    }

    async fn resolve(&self, claims: &GatewayClaims) -> Result<User> {
        let user = if let Some(user_id) = &claims.user_id {
            self.users.get_user(user_id).await?
        } else if let Some(clerk_id) = &claims.clerk_id {
            self.users.get_user_by_clerk_id(clerk_id).await?
        } else {
            None
        };
        user.ok_or(Error::UserNotFound)
    }
}
