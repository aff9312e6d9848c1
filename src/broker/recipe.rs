//! Provider refresh recipes
//!
//! Every OAuth provider family differs in a handful of transport details:
//! where the token endpoint lives, how the client authenticates, whether
//! the body is a form or JSON, and whether a refresh rotates the refresh
//! token. A [`RefreshRecipe`] captures exactly those differences; the
//! request itself is built once in [`super::exchange`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How the OAuth client authenticates at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// HTTP Basic `client_id:client_secret`
    Basic,
    /// `client_id` and `client_secret` as body parameters
    Form,
}

/// Token request body encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// `application/x-www-form-urlencoded`
    Form,
    /// `application/json`
    Json,
}

/// Transport rules of one provider family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecipe {
    /// Provider key used to look up the OAuth app
    pub provider: String,
    /// Token endpoint
    pub token_url: String,
    /// Authorization endpoint for the connect flow
    pub authorize_url: String,
    /// Scopes requested on authorization
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Client authentication method
    pub client_auth: ClientAuth,
    /// Body encoding of token requests
    pub encoding: BodyEncoding,
    /// Fixed parameters added to every token request
    #[serde(default)]
    pub extra_params: Vec<(String, String)>,
    /// Fixed parameters added to the authorization URL
    #[serde(default)]
    pub authorize_params: Vec<(String, String)>,
    /// Whether a refresh returns a new refresh token that replaces the old one
    pub rotates_refresh_token: bool,
}

impl RefreshRecipe {
    fn new(provider: &str, token_url: &str, authorize_url: &str) -> Self {
        Self {
            provider: provider.to_string(),
            token_url: token_url.to_string(),
            authorize_url: authorize_url.to_string(),
            scopes: Vec::new(),
            client_auth: ClientAuth::Form,
            encoding: BodyEncoding::Form,
            extra_params: Vec::new(),
            authorize_params: Vec::new(),
            rotates_refresh_token: false,
        }
    }

    fn scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| (*s).to_string()).collect();
        self
    }

    fn basic_auth(mut self) -> Self {
        self.client_auth = ClientAuth::Basic;
        self
    }

    fn json(mut self) -> Self {
        self.encoding = BodyEncoding::Json;
        self
    }

    fn rotating(mut self) -> Self {
        self.rotates_refresh_token = true;
        self
    }

    fn authorize_param(mut self, key: &str, value: &str) -> Self {
        self.authorize_params.push((key.to_string(), value.to_string()));
        self
    }
}

/// Module name to recipe lookup
#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    providers: HashMap<String, Arc<RefreshRecipe>>,
    modules: HashMap<String, String>,
}

impl RecipeRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in provider families and their modules
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            RefreshRecipe::new(
                "google",
                "https://oauth2.googleapis.com/token",
                "https://accounts.google.com/o/oauth2/v2/auth",
            )
            .authorize_param("access_type", "offline")
            .authorize_param("prompt", "consent"),
            &[
                "google_calendar",
                "google_drive",
                "google_docs",
                "google_sheets",
                "google_tasks",
                "google_apps_script",
            ],
        );
        registry.register(
            RefreshRecipe::new(
                "microsoft",
                "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            )
            .scopes(&["offline_access", "Tasks.ReadWrite", "User.Read"])
            .rotating(),
            &["microsoft_todo"],
        );
        registry.register(
            RefreshRecipe::new(
                "notion",
                "https://api.notion.com/v1/oauth/token",
                "https://api.notion.com/v1/oauth/authorize",
            )
            .basic_auth()
            .json()
            .authorize_param("owner", "user")
            .rotating(),
            &["notion"],
        );
        registry.register(
            RefreshRecipe::new(
                "github",
                "https://github.com/login/oauth/access_token",
                "https://github.com/login/oauth/authorize",
            )
            .scopes(&["repo", "read:user"])
            .rotating(),
            &["github"],
        );
        registry.register(
            RefreshRecipe::new(
                "atlassian",
                "https://auth.atlassian.com/oauth/token",
                "https://auth.atlassian.com/authorize",
            )
            .scopes(&[
                "offline_access",
                "read:jira-work",
                "write:jira-work",
                "read:confluence-content.all",
                "write:confluence-content",
            ])
            .json()
            .authorize_param("audience", "api.atlassian.com")
            .authorize_param("prompt", "consent")
            .rotating(),
            &["jira", "confluence"],
        );
        registry.register(
            RefreshRecipe::new(
                "asana",
                "https://app.asana.com/-/oauth_token",
                "https://app.asana.com/-/oauth_authorize",
            ),
            &["asana"],
        );
        registry.register(
            RefreshRecipe::new(
                "dropbox",
                "https://api.dropboxapi.com/oauth2/token",
                "https://www.dropbox.com/oauth2/authorize",
            )
            .authorize_param("token_access_type", "offline"),
            &["dropbox"],
        );
        registry.register(
            RefreshRecipe::new(
                "airtable",
                "https://airtable.com/oauth2/v1/token",
                "https://airtable.com/oauth2/v1/authorize",
            )
            .scopes(&["data.records:read", "data.records:write", "schema.bases:read"])
            .basic_auth()
            .rotating(),
            &["airtable"],
        );
        registry.register(
            RefreshRecipe::new(
                "ticktick",
                "https://ticktick.com/oauth/token",
                "https://ticktick.com/oauth/authorize",
            )
            .scopes(&["tasks:read", "tasks:write"])
            .basic_auth(),
            &["ticktick"],
        );
        registry.register(
            RefreshRecipe::new(
                "box",
                "https://api.box.com/oauth2/token",
                "https://account.box.com/api/oauth2/authorize",
            )
            .rotating(),
            &["box"],
        );

        registry
    }

    /// Register (or replace) a recipe and map modules onto its provider
    pub fn register(&mut self, recipe: RefreshRecipe, modules: &[&str]) {
        for module in modules {
            self.modules
                .insert((*module).to_string(), recipe.provider.clone());
        }
        self.providers
            .insert(recipe.provider.clone(), Arc::new(recipe));
    }

    /// Point a provider's token endpoint somewhere else.
    ///
    /// Returns `false` if the provider is unknown.
    pub fn override_token_url(&mut self, provider: &str, token_url: &str) -> bool {
        let Some(recipe) = self.providers.get_mut(provider) else {
            return false;
        };
        Arc::make_mut(recipe).token_url = token_url.to_string();
        true
    }

    /// Point a provider's authorization endpoint somewhere else.
    ///
    /// Returns `false` if the provider is unknown.
    pub fn override_authorize_url(&mut self, provider: &str, authorize_url: &str) -> bool {
        let Some(recipe) = self.providers.get_mut(provider) else {
            return false;
        };
        Arc::make_mut(recipe).authorize_url = authorize_url.to_string();
        true
    }

    /// Recipe for a module
    #[must_use]
    pub fn for_module(&self, module: &str) -> Option<Arc<RefreshRecipe>> {
        let provider = self.modules.get(module)?;
        self.providers.get(provider).cloned()
    }

    /// Recipe for a provider
    #[must_use]
    pub fn for_provider(&self, provider: &str) -> Option<Arc<RefreshRecipe>> {
        self.providers.get(provider).cloned()
    }

    /// Registered provider names, sorted
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
