//! Edge HTTP router
//!
//! The edge authenticates callers and forwards everything else to the
//! backend with a freshly minted gateway assertion. Inbound
//! `X-Gateway-Token` headers are always stripped so a caller can never
//! smuggle its own assertion through.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use super::session::SessionVerifier;
use crate::apikey::ApiKeyVerifier;
use crate::http::{bearer_token, check_bearer, error_response, health};
use crate::trust::{GATEWAY_TOKEN_HEADER, GatewayIdentity, GatewaySigner, JWKS_PATH};
use crate::{Error, Result};

/// Largest request body the edge forwards
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers never copied between hops
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Shared edge state
pub struct EdgeState {
    /// Assertion signer
    pub signer: Arc<GatewaySigner>,
    /// Browser session verifier
    pub sessions: Arc<SessionVerifier>,
    /// API key verifier
    pub api_keys: Arc<ApiKeyVerifier>,
    /// Client used to forward to the backend
    pub http: reqwest::Client,
    /// Backend base URL
    pub backend_url: String,
    /// Secret the backend presents on cache-bust calls
    pub internal_secret: String,
    /// Paths forwarded without authentication
    pub public_paths: Vec<String>,
    /// Per-request timeout
    pub request_timeout: std::time::Duration,
}

impl EdgeState {
    fn is_public(&self, path: &str) -> bool {
        self.public_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p.trim_end_matches('/'))))
    }

    /// Authenticate the caller of a request
    async fn authenticate(&self, headers: &HeaderMap) -> Result<GatewayIdentity> {
        let token = bearer_token(headers)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

        if ApiKeyVerifier::is_api_key(token) {
            let key = self.api_keys.verify(token).await?;
            debug!(user_id = %key.user_id, key_id = %key.key_id, "Authenticated by API key");
            return Ok(GatewayIdentity::User {
                user_id: key.user_id,
                email: None,
            });
        }

        let session = self.sessions.verify(token).await?;
        debug!(subject = %session.subject, "Authenticated by session");
        Ok(GatewayIdentity::Clerk {
            clerk_id: session.subject,
            email: session.email,
        })
    }
}

/// Create the edge router
pub fn create_router(state: Arc<EdgeState>) -> Router {
    let timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health))
        .route(JWKS_PATH, get(jwks_handler))
        .route("/internal/apikeys/{id}/invalidate", post(invalidate_handler))
        .fallback(forward_handler)
        .layer(TimeoutLayer::new(timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /.well-known/jwks.json`
async fn jwks_handler(State(state): State<Arc<EdgeState>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.signer.jwks()),
    )
}

/// `POST /internal/apikeys/{id}/invalidate`
async fn invalidate_handler(
    State(state): State<Arc<EdgeState>>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !check_bearer(&headers, &state.internal_secret) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid internal token");
    }

    let removed = state.api_keys.cache().invalidate(&key_id);
    debug!(key_id = %key_id, removed, "API key cache entry invalidated");
    StatusCode::NO_CONTENT.into_response()
}

/// Everything else: authenticate, mint, forward
async fn forward_handler(State(state): State<Arc<EdgeState>>, request: Request) -> Response {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(state: &EdgeState, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or(path.as_str(), |pq| pq.as_str());
    let url = url::Url::parse(&format!(
        "{}{path_and_query}",
        state.backend_url.trim_end_matches('/')
    ))
    .map_err(|e| Error::BadRequest(format!("invalid request path: {e}")))?;

    // Backend internal routes trust any valid assertion; they are never
    // reachable from outside, whatever the caller's credentials.
    if is_internal(&path) || is_internal(url.path()) {
        debug!(path = %path, "Refusing to forward internal path");
        return Err(Error::NotFound(path));
    }

    let assertion = if state.is_public(&path) {
        None
    } else {
        let identity = state.authenticate(&parts.headers).await?;
        Some(state.signer.mint(&identity)?)
    };

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::BadRequest(format!("unreadable request body: {e}")))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if is_forwardable(name) && name != header::AUTHORIZATION {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(assertion) = assertion {
        let value = HeaderValue::from_str(&assertion)
            .map_err(|e| Error::Internal(format!("invalid assertion header: {e}")))?;
        headers.insert(GATEWAY_TOKEN_HEADER, value);
    }

    let upstream = state
        .http
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(url = %url, error = %e, "Backend request failed");
            Error::Upstream(format!("backend unreachable: {e}"))
        })?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_forwardable(name) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::Upstream(format!("backend response unreadable: {e}")))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn is_internal(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    path == "internal" || path.starts_with("internal/")
}

fn is_forwardable(name: &HeaderName) -> bool {
    let name = name.as_str();
    name != GATEWAY_TOKEN_HEADER && !HOP_BY_HOP.contains(&name)
}
