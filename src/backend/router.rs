//! Backend HTTP router

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::BackendState;
use super::auth::{AdminUser, InternalCaller, Registrant, StandardUser};
use crate::authz::UserContext;
use crate::broker::AppCredentials;
use crate::credential::Credential;
use crate::http::health;
use crate::oauth_state::StatePayload;
use crate::store::{Role, User};
use crate::trust::JWKS_PATH;
use crate::{Error, Result};

/// Create the backend router
pub fn create_router(state: Arc<BackendState>) -> Router {
    let timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health))
        .route(JWKS_PATH, get(jwks_handler))
        .route("/internal/apikeys/{id}/status", get(key_status_handler))
        .route("/v1/register", post(register_handler))
        .route("/v1/me", get(me_handler))
        .route("/v1/me/modules/{module}", put(module_settings_handler))
        .route("/v1/apikeys", post(create_key_handler).get(list_keys_handler))
        .route("/v1/apikeys/{id}", axum::routing::delete(revoke_key_handler))
        .route(
            "/v1/credentials/{module}",
            put(put_credential_handler).delete(delete_credential_handler),
        )
        .route("/v1/oauth/{module}/authorize", get(authorize_handler))
        .route("/oauth/callback", get(callback_handler))
        .route("/v1/admin/oauth-apps/{provider}", put(put_app_handler))
        .route("/v1/admin/users/{id}/plan", put(set_plan_handler))
        .layer(TimeoutLayer::new(timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /.well-known/jwks.json` (API key verification keys)
async fn jwks_handler(State(state): State<Arc<BackendState>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.api_keys.jwks()),
    )
}

/// `GET /internal/apikeys/{id}/status`
async fn key_status_handler(
    State(state): State<Arc<BackendState>>,
    _caller: InternalCaller,
    Path(key_id): Path<String>,
) -> Result<Response> {
    match state.api_keys.status(&key_id).await? {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(Error::NotFound(format!("API key {key_id}"))),
    }
}

/// `POST /v1/register`
async fn register_handler(
    State(state): State<Arc<BackendState>>,
    registrant: Registrant,
) -> Result<Json<User>> {
    let mut user = state
        .users
        .create_user(&registrant.clerk_id, &registrant.email)
        .await?;

    if user.role != Role::Admin && state.admin_clerk_ids.contains(&registrant.clerk_id) {
        state.users.set_role(&user.id, Role::Admin).await?;
        user.role = Role::Admin;
        info!(user_id = %user.id, "Granted admin role on registration");
    }

    Ok(Json(user))
}

#[derive(Debug, Serialize)]
struct MeResponse {
    user: User,
    context: UserContext,
    connected_modules: Vec<String>,
}

/// `GET /v1/me`
async fn me_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
) -> Result<Json<MeResponse>> {
    let context = state.authz.get_user_context(&user.id).await?;
    let connected_modules = state.broker.vault().connected_modules(&user.id).await?;
    Ok(Json(MeResponse {
        user,
        context,
        connected_modules,
    }))
}

#[derive(Debug, Deserialize)]
struct ModuleSettingsBody {
    enabled: bool,
    #[serde(default)]
    tools: Option<Vec<String>>,
}

/// `PUT /v1/me/modules/{module}`
async fn module_settings_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Path(module): Path<String>,
    Json(body): Json<ModuleSettingsBody>,
) -> Result<StatusCode> {
    state.known_module(&module)?;

    state
        .settings
        .set_module(&user.id, &module, body.enabled, body.tools)
        .await?;
    state.authz.invalidate_cache(&user.id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateKeyBody {
    name: String,
    #[serde(default, with = "humantime_serde")]
    ttl: Option<Duration>,
}

/// `POST /v1/apikeys`
async fn create_key_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response> {
    if body.name.trim().is_empty() {
        return Err(Error::BadRequest("name must not be empty".to_string()));
    }
    let issued = state.api_keys.issue(&user.id, &body.name, body.ttl).await?;
    Ok((StatusCode::CREATED, Json(issued)).into_response())
}

/// `GET /v1/apikeys`
async fn list_keys_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
) -> Result<Response> {
    Ok(Json(state.api_keys.list(&user.id).await?).into_response())
}

/// `DELETE /v1/apikeys/{id}`
async fn revoke_key_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Path(key_id): Path<String>,
) -> Result<StatusCode> {
    state.api_keys.revoke(&user.id, &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /v1/credentials/{module}`
async fn put_credential_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Path(module): Path<String>,
    Json(credential): Json<Credential>,
) -> Result<StatusCode> {
    state.known_module(&module)?;
    state.broker.vault().put(&user.id, &module, &credential).await?;
    info!(user_id = %user.id, module = %module, auth_type = credential.auth_type(), "Stored credential");
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/credentials/{module}`
async fn delete_credential_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Path(module): Path<String>,
) -> Result<StatusCode> {
    if state.broker.vault().delete(&user.id, &module).await? {
        info!(user_id = %user.id, module = %module, "Deleted credential");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("no credential for module {module}")))
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    #[serde(default)]
    return_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuthorizeResponse {
    authorization_url: String,
}

/// `GET /v1/oauth/{module}/authorize`
async fn authorize_handler(
    State(state): State<Arc<BackendState>>,
    StandardUser(user): StandardUser,
    Path(module): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Json<AuthorizeResponse>> {
    let token = state.states.generate_state(&StatePayload {
        service: module.clone(),
        user_id: user.id,
        return_to: query.return_to.filter(|r| is_local_path(r)),
    })?;
    let authorization_url = state.broker.authorization_url(&module, &token).await?;
    Ok(Json(AuthorizeResponse { authorization_url }))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `GET /oauth/callback`
///
/// Authenticated by the signed state token alone.
async fn callback_handler(
    State(state): State<Arc<BackendState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect> {
    let token = query
        .state
        .ok_or_else(|| Error::BadRequest("missing state".to_string()))?;
    let payload = state.states.verify_state(&token)?;

    let target = payload
        .return_to
        .filter(|r| is_local_path(r))
        .unwrap_or_else(|| state.oauth_return_url.clone());

    if let Some(error) = query.error {
        warn!(user_id = %payload.user_id, module = %payload.service, error = %error, "Provider refused authorization");
        return Ok(Redirect::to(&with_query(&target, "error", &error)));
    }

    let code = query
        .code
        .ok_or_else(|| Error::BadRequest("missing code".to_string()))?;
    state
        .broker
        .exchange_code(&payload.user_id, &payload.service, &code)
        .await?;

    Ok(Redirect::to(&with_query(&target, "connected", &payload.service)))
}

#[derive(Debug, Deserialize)]
struct OAuthAppBody {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `PUT /v1/admin/oauth-apps/{provider}`
async fn put_app_handler(
    State(state): State<Arc<BackendState>>,
    AdminUser(admin): AdminUser,
    Path(provider): Path<String>,
    Json(body): Json<OAuthAppBody>,
) -> Result<StatusCode> {
    if state.broker.recipes().for_provider(&provider).is_none() {
        return Err(Error::NotFound(format!("provider {provider}")));
    }

    let app = AppCredentials {
        client_id: body.client_id,
        client_secret: body.client_secret,
        redirect_uri: body.redirect_uri,
        enabled: body.enabled,
    };
    state.broker.vault().put_app(&provider, &app).await?;
    info!(admin = %admin.id, provider = %provider, enabled = app.enabled, "Updated OAuth app");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SetPlanBody {
    plan_id: String,
}

/// `PUT /v1/admin/users/{id}/plan`
async fn set_plan_handler(
    State(state): State<Arc<BackendState>>,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<String>,
    Json(body): Json<SetPlanBody>,
) -> Result<StatusCode> {
    state.users.set_plan(&user_id, &body.plan_id).await?;
    state.authz.invalidate_cache(&user_id);
    info!(admin = %admin.id, user_id = %user_id, plan = %body.plan_id, "Changed plan");
    Ok(StatusCode::NO_CONTENT)
}

/// Same-origin path; rejects absolute and scheme-relative URLs
fn is_local_path(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//") && !target.contains('\\')
}

fn with_query(target: &str, key: &str, value: &str) -> String {
    let separator = if target.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(key, value)
        .finish();
    format!("{target}{separator}{encoded}")
}
