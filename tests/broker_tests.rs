//! Token broker tests against a local provider token endpoint
//!
//! Covers:
//! - Basic vs form client authentication, JSON vs form bodies
//! - Refresh token rotation rules
//! - Fallback to the stored credential when the provider refuses
//! - Single-flight refresh per (user, module)
//! - Authorization-code exchange and the connect URL

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::HeaderMap, http::StatusCode, routing::post};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use mcpist::Error;
use mcpist::broker::{AppCredentials, CredentialVault, RecipeRegistry, TokenBroker, provider_client};
use mcpist::cipher::{Cipher, KEY_SIZE};
use mcpist::credential::{AuthMaterial, Credential};
use mcpist::store::MemoryStore;

#[derive(Debug, Clone)]
struct Captured {
    authorization: Option<String>,
    content_type: Option<String>,
    body: String,
}

struct FakeProvider {
    status: StatusCode,
    response: Value,
    delay: Duration,
    hits: AtomicUsize,
    captured: Mutex<Vec<Captured>>,
}

impl FakeProvider {
    fn new(status: StatusCode, response: Value) -> Arc<Self> {
        Self::with_delay(status, response, Duration::ZERO)
    }

    fn with_delay(status: StatusCode, response: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            status,
            response,
            delay,
            hits: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last(&self) -> Captured {
        self.captured.lock().last().cloned().expect("no token request captured")
    }
}

async fn token_endpoint(
    State(provider): State<Arc<FakeProvider>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    provider.hits.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    provider.captured.lock().push(Captured {
        authorization: header("authorization"),
        content_type: header("content-type"),
        body,
    });
    if !provider.delay.is_zero() {
        tokio::time::sleep(provider.delay).await;
    }
    (provider.status, Json(provider.response.clone()))
}

async fn spawn_provider(provider: Arc<FakeProvider>) -> String {
    let app = Router::new()
        .route("/token", post(token_endpoint))
        .with_state(provider);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/token")
}

async fn broker_for(provider: &str, token_url: &str) -> TokenBroker {
    broker_with_timeout(provider, token_url, Duration::from_secs(5)).await
}

async fn broker_with_timeout(provider: &str, token_url: &str, timeout: Duration) -> TokenBroker {
    let store = Arc::new(MemoryStore::default());
    let cipher = Cipher::new(&[7u8; KEY_SIZE]).unwrap();
    let vault = CredentialVault::new(cipher, store.clone(), store);
    vault
        .put_app(
            provider,
            &AppCredentials {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                redirect_uri: "http://localhost:8080/oauth/callback".to_string(),
                enabled: true,
            },
        )
        .await
        .unwrap();

    let mut recipes = RecipeRegistry::builtin();
    assert!(recipes.override_token_url(provider, token_url));
    TokenBroker::new(vault, recipes, provider_client(timeout).unwrap())
}

fn expiring_in(secs: i64, refresh: &str) -> Credential {
    Credential::oauth2("at-old", Some(refresh.to_string()), Utc::now().timestamp() + secs)
}

fn token(credential: &Credential) -> (&str, Option<&str>, i64) {
    let t = credential.oauth2_token().expect("oauth2 credential");
    (t.access_token.as_str(), t.refresh_token.as_deref(), t.expires_at)
}

/// Notion: Basic client auth, JSON body, rotating refresh token
#[tokio::test]
async fn test_notion_refresh_uses_basic_auth_and_json() {
    let provider = FakeProvider::new(
        StatusCode::OK,
        json!({"access_token": "at-new", "refresh_token": "rt-new", "expires_in": 3600, "token_type": "bearer"}),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("notion", &url).await;
    broker.vault().put("u1", "notion", &expiring_in(120, "rt-old")).await.unwrap();

    let credential = broker.get_module_token("u1", "notion").await.unwrap();

    let (access, refresh, expires_at) = token(&credential);
    assert_eq!(access, "at-new");
    assert_eq!(refresh, Some("rt-new"));
    assert!(expires_at > Utc::now().timestamp() + 3000);

    let captured = provider.last();
    assert_eq!(
        captured.authorization.as_deref(),
        Some(format!("Basic {}", STANDARD.encode("client-id:client-secret")).as_str())
    );
    assert!(captured.content_type.unwrap().starts_with("application/json"));
    let body: Value = serde_json::from_str(&captured.body).unwrap();
    assert_eq!(body["grant_type"], "refresh_token");
    assert_eq!(body["refresh_token"], "rt-old");
    assert!(body.get("client_secret").is_none());

    let stored = broker.vault().get("u1", "notion").await.unwrap().unwrap();
    assert_eq!(stored, credential);
}

/// Google: credentials in a form body, refresh token never replaced
#[tokio::test]
async fn test_google_refresh_uses_form_body_and_keeps_refresh_token() {
    let provider = FakeProvider::new(
        StatusCode::OK,
        json!({"access_token": "at-new", "refresh_token": "rt-ignored", "expires_in": "3599"}),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("google", &url).await;
    let original = expiring_in(60, "rt-old").with_metadata("calendar_id", "primary");
    broker.vault().put("u1", "google_calendar", &original).await.unwrap();

    let credential = broker.get_module_token("u1", "google_calendar").await.unwrap();

    let (access, refresh, _) = token(&credential);
    assert_eq!(access, "at-new");
    assert_eq!(refresh, Some("rt-old"));
    assert_eq!(credential.metadata.get("calendar_id").map(String::as_str), Some("primary"));

    let captured = provider.last();
    assert!(captured.authorization.is_none());
    assert!(
        captured
            .content_type
            .unwrap()
            .starts_with("application/x-www-form-urlencoded")
    );
    let body: HashMap<String, String> = serde_urlencoded::from_str(&captured.body).unwrap();
    assert_eq!(body["grant_type"], "refresh_token");
    assert_eq!(body["refresh_token"], "rt-old");
    assert_eq!(body["client_id"], "client-id");
    assert_eq!(body["client_secret"], "client-secret");
}

/// A refused refresh hands back the stored credential unchanged
#[tokio::test]
async fn test_refresh_failure_returns_stored_credential() {
    let provider = FakeProvider::new(
        StatusCode::BAD_REQUEST,
        json!({"error": "invalid_grant", "error_description": "refresh token revoked"}),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("github", &url).await;
    let original = expiring_in(30, "rt-old");
    broker.vault().put("u1", "github", &original).await.unwrap();

    let credential = broker.get_module_token("u1", "github").await.unwrap();

    assert_eq!(credential, original);
    assert_eq!(provider.hits(), 1);
    assert_eq!(broker.vault().get("u1", "github").await.unwrap(), Some(original));
}

/// A 200 carrying an OAuth error body also falls back
#[tokio::test]
async fn test_error_body_with_ok_status_falls_back() {
    let provider = FakeProvider::new(StatusCode::OK, json!({"error": "bad_refresh_token"}));
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("github", &url).await;
    let original = expiring_in(30, "rt-old");
    broker.vault().put("u1", "github", &original).await.unwrap();

    assert_eq!(broker.get_module_token("u1", "github").await.unwrap(), original);
}

/// A provider that never answers in time is abandoned at the client timeout
#[tokio::test]
async fn test_hanging_provider_falls_back_to_stored_credential() {
    let provider = FakeProvider::with_delay(
        StatusCode::OK,
        json!({"access_token": "at-late", "expires_in": 3600}),
        Duration::from_secs(2),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_with_timeout("github", &url, Duration::from_millis(100)).await;
    let original = expiring_in(30, "rt-old");
    broker.vault().put("u1", "github", &original).await.unwrap();

    let started = std::time::Instant::now();
    let credential = broker.get_module_token("u1", "github").await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(credential, original);
    assert_eq!(provider.hits(), 1);
    assert_eq!(broker.vault().get("u1", "github").await.unwrap(), Some(original));
}

/// Concurrent callers for one (user, module) trigger one provider call
#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let provider = FakeProvider::with_delay(
        StatusCode::OK,
        json!({"access_token": "at-new", "refresh_token": "rt-new", "expires_in": 3600}),
        Duration::from_millis(200),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("notion", &url).await;
    broker.vault().put("u1", "notion", &expiring_in(10, "rt-old")).await.unwrap();

    let calls = (0..8).map(|_| broker.get_module_token("u1", "notion"));
    let results = futures::future::join_all(calls).await;

    assert_eq!(provider.hits(), 1);
    for result in results {
        assert_eq!(token(&result.unwrap()).0, "at-new");
    }
}

/// Tokens outside the refresh window are returned as stored
#[tokio::test]
async fn test_fresh_credential_skips_provider() {
    let provider = FakeProvider::new(StatusCode::OK, json!({"access_token": "unused"}));
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("notion", &url).await;
    let original = expiring_in(601, "rt-old");
    broker.vault().put("u1", "notion", &original).await.unwrap();

    assert_eq!(broker.get_module_token("u1", "notion").await.unwrap(), original);
    assert_eq!(provider.hits(), 0);
}

/// `expires_at == 0` and non-OAuth credentials never refresh
#[tokio::test]
async fn test_never_expiring_credentials_skip_provider() {
    let provider = FakeProvider::new(StatusCode::OK, json!({"access_token": "unused"}));
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("notion", &url).await;

    let forever = Credential::oauth2("at-forever", Some("rt".to_string()), 0);
    broker.vault().put("u1", "notion", &forever).await.unwrap();
    let api_key = Credential::new(AuthMaterial::ApiKey {
        api_key: "key".to_string(),
    });
    broker.vault().put("u1", "asana", &api_key).await.unwrap();

    assert_eq!(broker.get_module_token("u1", "notion").await.unwrap(), forever);
    assert_eq!(broker.get_module_token("u1", "asana").await.unwrap(), api_key);
    assert_eq!(provider.hits(), 0);
}

/// No stored credential is a hard error
#[tokio::test]
async fn test_missing_credential_is_not_found() {
    let broker = broker_for("notion", "http://127.0.0.1:9/token").await;
    assert!(matches!(
        broker.get_module_token("u1", "notion").await,
        Err(Error::NotFound(_))
    ));
}

/// Authorization-code exchange stores the new credential
#[tokio::test]
async fn test_exchange_code_stores_credential() {
    let provider = FakeProvider::new(
        StatusCode::OK,
        json!({"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 3600}),
    );
    let url = spawn_provider(provider.clone()).await;
    let broker = broker_for("notion", &url).await;

    let credential = broker.exchange_code("u1", "notion", "code-123").await.unwrap();
    assert_eq!(token(&credential).0, "at-1");
    assert_eq!(token(&credential).1, Some("rt-1"));

    let body: Value = serde_json::from_str(&provider.last().body).unwrap();
    assert_eq!(body["grant_type"], "authorization_code");
    assert_eq!(body["code"], "code-123");
    assert_eq!(body["redirect_uri"], "http://localhost:8080/oauth/callback");

    assert_eq!(broker.vault().get("u1", "notion").await.unwrap(), Some(credential));
    assert_eq!(broker.vault().connected_modules("u1").await.unwrap(), vec!["notion"]);
}

/// The connect URL carries the app, the state and provider extras
#[tokio::test]
async fn test_authorization_url_carries_client_and_state() {
    let broker = broker_for("notion", "http://127.0.0.1:9/token").await;

    let url = broker.authorization_url("notion", "signed-state").await.unwrap();
    let url = url::Url::parse(&url).unwrap();
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

    assert_eq!(url.host_str(), Some("api.notion.com"));
    assert_eq!(query["response_type"], "code");
    assert_eq!(query["client_id"], "client-id");
    assert_eq!(query["state"], "signed-state");
    assert_eq!(query["owner"], "user");
    assert_eq!(query["redirect_uri"], "http://localhost:8080/oauth/callback");

    assert!(matches!(
        broker.authorization_url("no_such_module", "s").await,
        Err(Error::Provider(_))
    ));
}
