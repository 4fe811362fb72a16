use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

/// OAuth 2.0 Token Response as returned by the token endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Persisted token set for one server (`tokens.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokens {
    /// Build a storable token set from a token endpoint response.
    ///
    /// A refresh response may omit the refresh token, in which case the
    /// previous one is carried over.
    pub fn from_response(response: TokenResponse, previous_refresh: Option<String>) -> Self {
        let expires_at = response
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token.or(previous_refresh),
            scope: response.scope,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

/// Client registration as stored in `client_info.json` (RFC 7591 response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,

    #[serde(flatten)]
    pub additional_metadata: HashMap<String, Value>,
}

impl OAuthClientInformation {
    /// Pre-registered client credentials that never touch storage.
    pub fn preregistered(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uris: Vec::new(),
            client_id_issued_at: None,
            client_secret_expires_at: None,
            additional_metadata: HashMap::new(),
        }
    }

    /// Whether this registration can be used with `redirect_url`. A client
    /// registered without explicit redirect URIs accepts any.
    pub fn accepts_redirect(&self, redirect_url: &str) -> bool {
        self.redirect_uris.is_empty() || self.redirect_uris.iter().any(|uri| uri == redirect_url)
    }
}

/// Dynamic Client Registration payload (RFC 7591)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub redirect_uris: Vec<String>,
    pub client_name: String,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub software_id: String,
    pub software_version: String,

    #[serde(flatten)]
    pub additional_metadata: HashMap<String, Value>,
}

impl ClientMetadata {
    pub fn for_redirect(redirect_url: &str) -> Self {
        Self {
            redirect_uris: vec![redirect_url.to_string()],
            client_name: "MCP Fleet".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "none".to_string(),
            client_uri: None,
            scope: None,
            software_id: "mcp-fleet".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            additional_metadata: HashMap::new(),
        }
    }

    /// Overlay static overrides on top of this payload, key by key.
    pub fn merged_with(&self, overrides: &Map<String, Value>) -> serde_json::Result<Self> {
        let mut base = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in overrides {
            base.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(base))
    }
}

/// OAuth Server Metadata Discovery (RFC 8414)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    #[serde(flatten)]
    pub additional_metadata: HashMap<String, Value>,
}

/// PKCE (Proof Key for Code Exchange) parameters for one authorization attempt
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

/// Query parameters delivered to the callback listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub code: String,
    pub state: Option<String>,
}

/// One file in a server's credential namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialFile {
    ClientInfo,
    Tokens,
    CodeVerifier,
}

impl CredentialFile {
    pub const ALL: [CredentialFile; 3] = [
        CredentialFile::ClientInfo,
        CredentialFile::Tokens,
        CredentialFile::CodeVerifier,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            CredentialFile::ClientInfo => "client_info.json",
            CredentialFile::Tokens => "tokens.json",
            CredentialFile::CodeVerifier => "code_verifier.txt",
        }
    }
}

/// Which credentials to drop when a sub-flow has to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    All,
    Client,
    Tokens,
    Verifier,
}

impl InvalidationScope {
    pub fn files(&self) -> &'static [CredentialFile] {
        match self {
            InvalidationScope::All => &CredentialFile::ALL,
            InvalidationScope::Client => &[CredentialFile::ClientInfo],
            InvalidationScope::Tokens => &[CredentialFile::Tokens],
            InvalidationScope::Verifier => &[CredentialFile::CodeVerifier],
        }
    }
}
