pub type Result<T> = std::result::Result<T, OAuthError>;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Browser launch error: {0}")]
    BrowserLaunch(String),

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("Dynamic client registration failed: {0}")]
    ClientRegistration(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("No PKCE code verifier stored; the authorization step must be restarted")]
    MissingVerifier,

    #[error("No client information available for token exchange")]
    MissingClientInformation,

    #[error("State parameter mismatch in authorization callback")]
    StateMismatch,

    #[error("Timed out waiting for the user to complete authorization")]
    AuthTimeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl OAuthError {
    /// Whether this failure happened while persisting credentials.
    pub fn is_storage(&self) -> bool {
        matches!(self, OAuthError::Storage(_) | OAuthError::Io(_))
    }
}

impl From<keyring::Error> for OAuthError {
    fn from(err: keyring::Error) -> Self {
        OAuthError::Storage(err.to_string())
    }
}
