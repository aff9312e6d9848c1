//! Token endpoint requests
//!
//! One request builder for every provider: the grant-specific parameters
//! come from the caller, client authentication and body encoding come from
//! the [`RefreshRecipe`].

use std::collections::BTreeMap;

use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use super::recipe::{BodyEncoding, ClientAuth, RefreshRecipe};
use super::vault::AppCredentials;
use crate::credential::{AuthMaterial, Credential, OAuth2Token};
use crate::{Error, Result};

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// New access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// New refresh token, if the provider issued one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the access token in seconds
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    pub expires_in: Option<i64>,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
    /// OAuth error code (some providers answer errors with 200)
    #[serde(default)]
    pub error: Option<String>,
    /// OAuth error description
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry for a response received at `now`; `0` when the
    /// provider reports no (or a non-positive) lifetime
    #[must_use]
    pub fn expires_at(&self, now: i64) -> i64 {
        match self.expires_in {
            Some(secs) if secs > 0 => now.saturating_add(secs),
            _ => 0,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLifetime {
    Int(i64),
    Text(String),
}

fn deserialize_expires_in<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawLifetime>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawLifetime::Int(secs)) => Ok(Some(secs)),
        Some(RawLifetime::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// POST a grant to the recipe's token endpoint.
///
/// `grant` holds the grant-specific parameters (`grant_type`, `code`,
/// `refresh_token`, ...).
///
/// # Errors
///
/// Returns [`Error::Provider`] on transport failure, non-2xx status, an
/// OAuth error body, or a response without an access token.
pub async fn request_token(
    client: &Client,
    recipe: &RefreshRecipe,
    app: &AppCredentials,
    grant: &[(&str, &str)],
) -> Result<(TokenResponse, String)> {
    let mut params: BTreeMap<String, String> = grant
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    for (key, value) in &recipe.extra_params {
        params.insert(key.clone(), value.clone());
    }

    let mut request = client
        .post(&recipe.token_url)
        .header(reqwest::header::ACCEPT, "application/json");

    match recipe.client_auth {
        ClientAuth::Basic => {
            request = request.basic_auth(&app.client_id, Some(&app.client_secret));
        }
        ClientAuth::Form => {
            params.insert("client_id".to_string(), app.client_id.clone());
            params.insert("client_secret".to_string(), app.client_secret.clone());
        }
    }

    request = match recipe.encoding {
        BodyEncoding::Form => request.form(&params),
        BodyEncoding::Json => request.json(&params),
    };

    let response = request
        .send()
        .await
        .map_err(|e| Error::Provider(format!("{} token request failed: {e}", recipe.provider)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Provider(format!(
            "{} token endpoint returned HTTP {status}: {body}",
            recipe.provider
        )));
    }

    let token: TokenResponse = response.json().await.map_err(|e| {
        Error::Provider(format!("Failed to parse {} token response: {e}", recipe.provider))
    })?;

    if let Some(error) = &token.error {
        return Err(Error::Provider(format!(
            "{} token endpoint returned {error}: {}",
            recipe.provider,
            token.error_description.as_deref().unwrap_or("")
        )));
    }

    let access_token = token
        .access_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::Provider(format!("{} token response has no access_token", recipe.provider))
        })?;

    debug!(
        provider = %recipe.provider,
        expires_in = ?token.expires_in,
        rotated = token.refresh_token.is_some(),
        "Token endpoint answered"
    );
    Ok((token, access_token))
}

/// Build the refreshed credential from the original and the provider answer.
///
/// Metadata is preserved. The refresh token is replaced only when the
/// recipe says the provider rotates it and a new one was returned.
#[must_use]
pub fn refreshed_credential(
    original: &Credential,
    response: &TokenResponse,
    access_token: String,
    rotates_refresh_token: bool,
    now: i64,
) -> Credential {
    let original_refresh = original
        .oauth2_token()
        .and_then(|t| t.refresh_token.clone());
    let refresh_token = match (&response.refresh_token, rotates_refresh_token) {
        (Some(new), true) if !new.is_empty() => Some(new.clone()),
        _ => original_refresh,
    };

    Credential {
        auth: AuthMaterial::OAuth2(OAuth2Token {
            access_token,
            refresh_token,
            expires_at: response.expires_at(now),
        }),
        metadata: original.metadata.clone(),
    }
}

/// Build a fresh credential from an authorization-code exchange
#[must_use]
pub fn exchanged_credential(response: &TokenResponse, access_token: String, now: i64) -> Credential {
    Credential::oauth2(
        access_token,
        response.refresh_token.clone().filter(|r| !r.is_empty()),
        response.expires_at(now),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: serde_json::Value) -> TokenResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn expires_in_accepts_number_and_string() {
        assert_eq!(response(json!({"expires_in": 3600})).expires_in, Some(3600));
        assert_eq!(response(json!({"expires_in": "3600"})).expires_in, Some(3600));
        assert_eq!(response(json!({})).expires_in, None);
    }

    #[test]
    fn missing_or_zero_lifetime_never_expires() {
        assert_eq!(response(json!({})).expires_at(1000), 0);
        assert_eq!(response(json!({"expires_in": 0})).expires_at(1000), 0);
        assert_eq!(response(json!({"expires_in": 60})).expires_at(1000), 1060);
    }

    #[test]
    fn rotation_follows_recipe() {
        let original = Credential::oauth2("old", Some("rt-old".into()), 10)
            .with_metadata("cloud_id", "c1");
        let answer = response(json!({"access_token": "new", "refresh_token": "rt-new", "expires_in": 100}));

        let rotated = refreshed_credential(&original, &answer, "new".into(), true, 1000);
        let token = rotated.oauth2_token().unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-new"));
        assert_eq!(token.expires_at, 1100);
        assert_eq!(rotated.metadata.get("cloud_id").unwrap(), "c1");

        let kept = refreshed_credential(&original, &answer, "new".into(), false, 1000);
        assert_eq!(kept.oauth2_token().unwrap().refresh_token.as_deref(), Some("rt-old"));
    }

    #[test]
    fn rotating_provider_without_new_token_keeps_original() {
        let original = Credential::oauth2("old", Some("rt-old".into()), 10);
        let answer = response(json!({"access_token": "new", "expires_in": 100}));
        let cred = refreshed_credential(&original, &answer, "new".into(), true, 0);
        assert_eq!(cred.oauth2_token().unwrap().refresh_token.as_deref(), Some("rt-old"));
    }
}
