//! MCPist trust and credential subsystem
//!
//! Two processes share this crate:
//!
//! - the **edge** authenticates browser sessions and `mpt_` API keys, mints
//!   30-second Ed25519 gateway assertions and forwards requests;
//! - the **backend** verifies those assertions against the edge's JWKS and
//!   owns users, the encrypted credential vault, token refresh, the
//!   authorization context cache, API keys and the OAuth connect flow.
//!
//! Module wrappers get credentials only through
//! [`broker::TokenBroker::get_module_token`] or [`authz::ToolGate::authorize`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apikey;
pub mod authz;
pub mod backend;
pub mod broker;
pub mod cipher;
pub mod cli;
pub mod config;
pub mod credential;
pub mod edge;
pub mod error;
pub mod http;
pub mod oauth_state;
pub mod store;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
