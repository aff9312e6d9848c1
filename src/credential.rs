//! Credential data model
//!
//! A [`Credential`] is the secret material a user supplies so MCPist can
//! call a third-party service on their behalf. The auth kind is a tagged
//! union ([`AuthMaterial`]); the serialized form stays flat so existing rows
//! read as `{"auth_type": "oauth2", "access_token": ..., "metadata": {...}}`.

use std::collections::HashMap;

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};

/// Stored credential for one (user, module) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Auth-kind specific fields
    #[serde(flatten)]
    pub auth: AuthMaterial,

    /// Provider-specific context (domain, cloud ID, base URL)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Secret material, one variant per `auth_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type")]
pub enum AuthMaterial {
    /// OAuth 2.0 bearer token with optional refresh token
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Token),

    /// OAuth 1.0a token (Trello and friends)
    #[serde(rename = "oauth1")]
    OAuth1 {
        /// Consumer key
        consumer_key: String,
        /// Consumer secret
        consumer_secret: String,
        /// Access token
        access_token: String,
        /// Access token secret
        access_token_secret: String,
    },

    /// Static API key
    #[serde(rename = "api_key")]
    ApiKey {
        /// The key
        api_key: String,
    },

    /// HTTP Basic credentials
    #[serde(rename = "basic")]
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },

    /// Token sent in a provider-specific header
    #[serde(rename = "custom_header")]
    CustomHeader {
        /// Token value
        token: String,
        /// Header the token goes into
        header_name: String,
    },
}

/// OAuth 2.0 token fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Token {
    /// Access token
    pub access_token: String,

    /// Refresh token, if the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Expiry as Unix seconds; `0` means the token never expires
    #[serde(default, deserialize_with = "deserialize_expires_at")]
    pub expires_at: i64,
}

impl Credential {
    /// Create a credential without metadata
    #[must_use]
    pub fn new(auth: AuthMaterial) -> Self {
        Self {
            auth,
            metadata: HashMap::new(),
        }
    }

    /// Shorthand for an OAuth 2.0 credential
    #[must_use]
    pub fn oauth2(access_token: impl Into<String>, refresh_token: Option<String>, expires_at: i64) -> Self {
        Self::new(AuthMaterial::OAuth2(OAuth2Token {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }))
    }

    /// Attach a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The `auth_type` tag of this credential
    #[must_use]
    pub fn auth_type(&self) -> &'static str {
        match self.auth {
            AuthMaterial::OAuth2(_) => "oauth2",
            AuthMaterial::OAuth1 { .. } => "oauth1",
            AuthMaterial::ApiKey { .. } => "api_key",
            AuthMaterial::Basic { .. } => "basic",
            AuthMaterial::CustomHeader { .. } => "custom_header",
        }
    }

    /// OAuth 2.0 fields, if this is an OAuth 2.0 credential
    #[must_use]
    pub fn oauth2_token(&self) -> Option<&OAuth2Token> {
        match &self.auth {
            AuthMaterial::OAuth2(token) => Some(token),
            _ => None,
        }
    }

    /// OAuth 2.0 fields, only when a refresh token is present
    #[must_use]
    pub fn refreshable(&self) -> Option<(&OAuth2Token, &str)> {
        let token = self.oauth2_token()?;
        let refresh = token.refresh_token.as_deref().filter(|r| !r.is_empty())?;
        Some((token, refresh))
    }
}

/// Providers disagree on how they report expiry; accept all of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpiry {
    Int(i64),
    Float(f64),
    Text(String),
}

fn deserialize_expires_at<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawExpiry>::deserialize(deserializer)?;
    match raw {
        None => Ok(0),
        Some(RawExpiry::Int(secs)) => Ok(secs),
        #[allow(clippy::cast_possible_truncation)]
        Some(RawExpiry::Float(secs)) => Ok(secs as i64),
        Some(RawExpiry::Text(text)) => parse_expiry_text(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse an ISO-8601 timestamp or a numeric string into Unix seconds.
fn parse_expiry_text(text: &str) -> Result<i64, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    if let Ok(secs) = text.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp());
    }
    // Offset-less ISO-8601 ("2025-01-01T00:00:00") is read as UTC
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().timestamp())
        .map_err(|_| format!("unrecognized expires_at value: {text}"))
}
