//! Error types for the MCPist trust and credential subsystem

use std::io;

use thiserror::Error;

/// Result type alias for MCPist
pub type Result<T> = std::result::Result<T, Error>;

/// MCPist errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ciphertext failed authentication or could not be decoded
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Ciphertext carries a version prefix this build cannot read
    #[error("Unsupported ciphertext version: {0}")]
    UnsupportedVersion(String),

    /// Signed token (state, assertion, API key) failed verification
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Signed token is older than its allowed lifetime
    #[error("Token expired: {0}")]
    Expired(String),

    /// Caller presented no usable credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Gateway assertion did not resolve to an internal user
    #[error("User not found")]
    UserNotFound,

    /// Request is malformed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// User account is not active
    #[error("Account is not active: {0}")]
    AccountSuspended(String),

    /// Module is not enabled for the user
    #[error("Module not enabled: {0}")]
    ModuleDisabled(String),

    /// Tool is not enabled for the user
    #[error("Tool not enabled: {module}:{tool}")]
    ToolDisabled {
        /// Module name
        module: String,
        /// Tool name
        tool: String,
    },

    /// Daily usage limit would be exceeded
    #[error("Daily limit exceeded ({used}/{limit})")]
    QuotaExceeded {
        /// Usage so far today
        used: u64,
        /// Daily limit of the user's plan
        limit: u64,
    },

    /// Provider token endpoint rejected or failed a request
    #[error("Provider error: {0}")]
    Provider(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Peer service (edge or backend) unreachable or misbehaving
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable code used in JSON error bodies
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Crypto(_) | Self::UnsupportedVersion(_) => "crypto_error",
            Self::InvalidToken(_) => "invalid_token",
            Self::Expired(_) => "token_expired",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::UserNotFound => "user_not_found",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::AccountSuspended(_) => "account_suspended",
            Self::ModuleDisabled(_) => "module_disabled",
            Self::ToolDisabled { .. } => "tool_disabled",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Provider(_) => "provider_error",
            Self::Store(_) => "store_error",
            Self::Upstream(_) => "upstream_error",
            Self::Json(_) => "invalid_json",
            Self::Io(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;

        match self {
            Self::InvalidToken(_) | Self::Expired(_) | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_)
            | Self::AccountSuspended(_)
            | Self::ModuleDisabled(_)
            | Self::ToolDisabled { .. } => StatusCode::FORBIDDEN,
            Self::UserNotFound | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Json(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Provider(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
