//! Backend route tests via `tower::ServiceExt::oneshot`
//!
//! Assertions are minted with a local edge key; the backend verifies them
//! from a static key set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode, header},
    routing::post,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use mcpist::apikey::ApiKeyIssuer;
use mcpist::authz::AuthorizationContext;
use mcpist::backend::{BackendState, create_router};
use mcpist::broker::{CredentialVault, RecipeRegistry, TokenBroker, provider_client};
use mcpist::cipher::{Cipher, KEY_SIZE};
use mcpist::oauth_state::StateSigner;
use mcpist::store::{MemoryStore, PlanLimits};
use mcpist::trust::{
    Ed25519Key, GATEWAY_TOKEN_HEADER, GatewayIdentity, GatewaySigner, GatewayVerifier, JwksCache,
    TrustBridge, apikey_kid, gateway_kid,
};

struct Api {
    router: Router,
    signer: GatewaySigner,
    state: Arc<BackendState>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Api {
    fn new(token_url: Option<&str>) -> Self {
        let signer = GatewaySigner::new(Ed25519Key::from_seed(&[1; 32], gateway_kid("v1")).unwrap());
        let store = Arc::new(MemoryStore::new(
            HashMap::from([
                ("free".to_string(), PlanLimits { daily_limit: 100 }),
                ("pro".to_string(), PlanLimits { daily_limit: 10_000 }),
            ]),
            BTreeMap::from([
                ("notion".to_string(), "Notion".to_string()),
                ("github".to_string(), "GitHub".to_string()),
            ]),
        ));

        let mut recipes = RecipeRegistry::builtin();
        if let Some(url) = token_url {
            recipes.override_token_url("notion", url);
        }
        let vault = CredentialVault::new(Cipher::new(&[9u8; KEY_SIZE]).unwrap(), store.clone(), store.clone());
        let broker = Arc::new(TokenBroker::new(
            vault,
            recipes,
            provider_client(Duration::from_secs(5)).unwrap(),
        ));

        let jwks = Arc::new(JwksCache::from_static(signer.jwks()));
        let apikey_key = Ed25519Key::from_seed(&[2; 32], apikey_kid("v1")).unwrap();

        let state = Arc::new(BackendState {
            bridge: TrustBridge::new(GatewayVerifier::new(jwks), store.clone()),
            broker,
            authz: Arc::new(AuthorizationContext::new(
                store.clone(),
                store.clone(),
                Duration::from_secs(30),
            )),
            states: StateSigner::new(b"state-secret").unwrap(),
            api_keys: ApiKeyIssuer::new(apikey_key, store.clone()),
            users: store.clone(),
            settings: store,
            modules: BTreeMap::from([
                ("notion".to_string(), "Notion".to_string()),
                ("github".to_string(), "GitHub".to_string()),
            ]),
            admin_clerk_ids: vec!["clerk_admin".to_string()],
            oauth_return_url: "/dashboard".to_string(),
            request_timeout: Duration::from_secs(10),
        });

        Self {
            router: create_router(state.clone()),
            signer,
            state,
        }
    }

    async fn call(&self, method: Method, uri: &str, identity: Option<&GatewayIdentity>, body: Option<Value>) -> Reply {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(identity) = identity {
            request = request.header(GATEWAY_TOKEN_HEADER, self.signer.mint(identity).unwrap());
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply { status, headers, body }
    }

    /// Register a subject and return (user ID, identity for later calls)
    async fn register(&self, clerk_id: &str) -> (String, GatewayIdentity) {
        let registrant = clerk(clerk_id, Some(&format!("{clerk_id}@example.com")));
        let reply = self.call(Method::POST, "/v1/register", Some(&registrant), None).await;
        assert_eq!(reply.status, StatusCode::OK);
        let user_id = reply.body["id"].as_str().unwrap().to_string();
        let identity = GatewayIdentity::User {
            user_id: user_id.clone(),
            email: None,
        };
        (user_id, identity)
    }
}

fn clerk(id: &str, email: Option<&str>) -> GatewayIdentity {
    GatewayIdentity::Clerk {
        clerk_id: id.to_string(),
        email: email.map(str::to_string),
    }
}

#[tokio::test]
async fn test_health_and_jwks_need_no_assertion() {
    let api = Api::new(None);

    let reply = api.call(Method::GET, "/health", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["status"], "ok");

    let reply = api.call(Method::GET, "/.well-known/jwks.json", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["keys"][0]["kid"], "mcpist-apikey-v1");
    assert_eq!(reply.body["keys"][0]["alg"], "EdDSA");
    assert_eq!(
        reply.headers.get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=3600"
    );
}

/// Registration is idempotent and promotes configured admins
#[tokio::test]
async fn test_register_creates_user_once() {
    let api = Api::new(None);
    let registrant = clerk("clerk_1", Some("one@example.com"));

    let first = api.call(Method::POST, "/v1/register", Some(&registrant), None).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["email"], "one@example.com");
    assert_eq!(first.body["role"], "user");
    assert_eq!(first.body["plan_id"], "free");

    let second = api.call(Method::POST, "/v1/register", Some(&registrant), None).await;
    assert_eq!(second.body["id"], first.body["id"]);

    let admin = api
        .call(Method::POST, "/v1/register", Some(&clerk("clerk_admin", Some("ops@example.com"))), None)
        .await;
    assert_eq!(admin.body["role"], "admin");

    let no_email = api.call(Method::POST, "/v1/register", Some(&clerk("clerk_2", None)), None).await;
    assert_eq!(no_email.status, StatusCode::UNAUTHORIZED);
}

/// Standard routes refuse missing assertions and unknown users
#[tokio::test]
async fn test_me_requires_registered_user() {
    let api = Api::new(None);

    let reply = api.call(Method::GET, "/v1/me", None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["error"], "unauthorized");

    let reply = api.call(Method::GET, "/v1/me", Some(&clerk("clerk_new", None)), None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["error"], "user_not_found");

    api.register("clerk_new").await;
    let reply = api.call(Method::GET, "/v1/me", Some(&clerk("clerk_new", None)), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["context"]["daily_limit"], 100);
    assert_eq!(reply.body["connected_modules"], json!([]));
}

/// Module settings are stored and visible immediately
#[tokio::test]
async fn test_module_settings_invalidate_context() {
    let api = Api::new(None);
    let (_, me) = api.register("clerk_1").await;

    // Prime the context cache
    api.call(Method::GET, "/v1/me", Some(&me), None).await;

    let reply = api
        .call(
            Method::PUT,
            "/v1/me/modules/notion",
            Some(&me),
            Some(json!({"enabled": true, "tools": ["search"]})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = api.call(Method::GET, "/v1/me", Some(&me), None).await;
    assert_eq!(reply.body["context"]["enabled_modules"], json!(["notion"]));
    assert_eq!(reply.body["context"]["enabled_tools"]["notion"], json!(["search"]));

    let reply = api
        .call(Method::PUT, "/v1/me/modules/trello", Some(&me), Some(json!({"enabled": true})))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

/// Credentials can be stored and deleted; nothing leaks back
#[tokio::test]
async fn test_credential_put_and_delete() {
    let api = Api::new(None);
    let (user_id, me) = api.register("clerk_1").await;

    let reply = api
        .call(
            Method::PUT,
            "/v1/credentials/github",
            Some(&me),
            Some(json!({"auth_type": "api_key", "api_key": "ghp_secret"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = api.call(Method::GET, "/v1/me", Some(&me), None).await;
    assert_eq!(reply.body["connected_modules"], json!(["github"]));
    assert!(!reply.body.to_string().contains("ghp_secret"));

    let stored = api.state.broker.vault().get(&user_id, "github").await.unwrap().unwrap();
    assert_eq!(stored.auth_type(), "api_key");

    let reply = api.call(Method::DELETE, "/v1/credentials/github", Some(&me), None).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    let reply = api.call(Method::DELETE, "/v1/credentials/github", Some(&me), None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

/// Credentials for modules outside the catalog are refused, not stored
#[tokio::test]
async fn test_credential_for_unknown_module_is_rejected() {
    let api = Api::new(None);
    let (user_id, me) = api.register("clerk_1").await;

    let reply = api
        .call(
            Method::PUT,
            "/v1/credentials/trello",
            Some(&me),
            Some(json!({"auth_type": "api_key", "api_key": "trello_secret"})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["error"], "not_found");
    assert!(api.state.broker.vault().get(&user_id, "trello").await.unwrap().is_none());
}

/// Issue, inspect via the internal status route, revoke
#[tokio::test]
async fn test_api_key_lifecycle() {
    let api = Api::new(None);
    let (user_id, me) = api.register("clerk_1").await;

    let reply = api
        .call(Method::POST, "/v1/apikeys", Some(&me), Some(json!({"name": "laptop", "ttl": "30days"})))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert!(reply.body["token"].as_str().unwrap().starts_with("mpt_"));
    assert!(reply.body["expires_at"].is_i64());
    let key_id = reply.body["key_id"].as_str().unwrap().to_string();

    let status_uri = format!("/internal/apikeys/{key_id}/status");
    let reply = api.call(Method::GET, &status_uri, None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = api.call(Method::GET, &status_uri, Some(&me), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["active"], true);
    assert_eq!(reply.body["user_id"], user_id.as_str());

    let reply = api.call(Method::GET, "/v1/apikeys", Some(&me), None).await;
    assert_eq!(reply.body.as_array().unwrap().len(), 1);

    let (_, other) = api.register("clerk_2").await;
    let reply = api.call(Method::DELETE, &format!("/v1/apikeys/{key_id}"), Some(&other), None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = api.call(Method::DELETE, &format!("/v1/apikeys/{key_id}"), Some(&me), None).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = api.call(Method::GET, &status_uri, Some(&me), None).await;
    assert_eq!(reply.body["active"], false);

    let reply = api.call(Method::GET, "/internal/apikeys/unknown/status", Some(&me), None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = api
        .call(Method::POST, "/v1/apikeys", Some(&me), Some(json!({"name": " "})))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

/// Admin routes need the admin role
#[tokio::test]
async fn test_admin_routes_require_admin() {
    let api = Api::new(None);
    let (user_id, me) = api.register("clerk_1").await;
    let (_, admin) = api.register("clerk_admin").await;

    let plan = json!({"plan_id": "pro"});
    let uri = format!("/v1/admin/users/{user_id}/plan");
    let reply = api.call(Method::PUT, &uri, Some(&me), Some(plan.clone())).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    api.call(Method::GET, "/v1/me", Some(&me), None).await;
    let reply = api.call(Method::PUT, &uri, Some(&admin), Some(plan)).await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = api.call(Method::GET, "/v1/me", Some(&me), None).await;
    assert_eq!(reply.body["context"]["plan_id"], "pro");
    assert_eq!(reply.body["context"]["daily_limit"], 10_000);

    let reply = api
        .call(Method::PUT, &uri, Some(&admin), Some(json!({"plan_id": "platinum"})))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let app = json!({"client_id": "id", "client_secret": "secret", "redirect_uri": "http://localhost/oauth/callback"});
    let reply = api
        .call(Method::PUT, "/v1/admin/oauth-apps/nope", Some(&admin), Some(app))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

async fn token_endpoint() -> Json<Value> {
    Json(json!({"access_token": "at-connected", "refresh_token": "rt-connected", "expires_in": 3600}))
}

async fn spawn_provider() -> String {
    let app = Router::new().route("/token", post(token_endpoint));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/token")
}

/// Connect flow: app registration, authorize URL, callback, stored credential
#[tokio::test]
async fn test_oauth_connect_flow() {
    let token_url = spawn_provider().await;
    let api = Api::new(Some(&token_url));
    let (user_id, me) = api.register("clerk_1").await;
    let (_, admin) = api.register("clerk_admin").await;

    let app = json!({
        "client_id": "notion-client",
        "client_secret": "notion-secret",
        "redirect_uri": "http://localhost:8080/oauth/callback"
    });
    let reply = api
        .call(Method::PUT, "/v1/admin/oauth-apps/notion", Some(&admin), Some(app))
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let reply = api
        .call(Method::GET, "/v1/oauth/notion/authorize?return_to=/settings", Some(&me), None)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    let url = url::Url::parse(reply.body["authorization_url"].as_str().unwrap()).unwrap();
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(query["client_id"], "notion-client");
    let state = query["state"].clone();

    // Tampered state is refused
    let mut tampered = state.clone();
    tampered.push('x');
    let reply = api
        .call(Method::GET, &format!("/oauth/callback?code=abc&state={tampered}"), None, None)
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = api
        .call(Method::GET, &format!("/oauth/callback?code=abc&state={state}"), None, None)
        .await;
    assert_eq!(reply.status, StatusCode::SEE_OTHER);
    assert_eq!(
        reply.headers.get(header::LOCATION).unwrap(),
        "/settings?connected=notion"
    );

    let stored = api.state.broker.vault().get(&user_id, "notion").await.unwrap().unwrap();
    assert_eq!(stored.oauth2_token().unwrap().access_token, "at-connected");

    let reply = api
        .call(Method::GET, &format!("/oauth/callback?error=access_denied&state={state}"), None, None)
        .await;
    assert_eq!(
        reply.headers.get(header::LOCATION).unwrap(),
        "/settings?error=access_denied"
    );
}

/// Absolute return targets fall back to the configured landing page
#[tokio::test]
async fn test_callback_ignores_foreign_return_target() {
    let api = Api::new(None);
    let token = api
        .state
        .states
        .generate_state(&mcpist::oauth_state::StatePayload {
            service: "notion".to_string(),
            user_id: "user-1".to_string(),
            return_to: Some("https://evil.example".to_string()),
        })
        .unwrap();

    let reply = api
        .call(Method::GET, &format!("/oauth/callback?error=access_denied&state={token}"), None, None)
        .await;
    assert_eq!(reply.status, StatusCode::SEE_OTHER);
    assert_eq!(
        reply.headers.get(header::LOCATION).unwrap(),
        "/dashboard?error=access_denied"
    );

    let reply = api.call(Method::GET, "/oauth/callback?code=abc", None, None).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}
