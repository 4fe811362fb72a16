use mcp_oauth::OAuthError;
use reqwest::StatusCode;
use rmcp::transport::sse_client::SseTransportError;
use rmcp::transport::streamable_http_client::StreamableHttpError;
use std::error::Error as StdError;

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Why a connection attempt or liveness check failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Malformed server entry. Fatal to that entry only.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to start server: {0}")]
    Spawn(String),

    /// The server demanded authorization. Drives the OAuth sub-flow.
    #[error("Server requires authorization: {0}")]
    Unauthorized(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Liveness check failed: {0}")]
    Liveness(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Classify a transport or handshake failure, recognising a rejected
    /// credential anywhere in the error's source chain.
    pub fn from_transport_error<E>(err: &E) -> Self
    where
        E: StdError + 'static,
    {
        let message = err.to_string();
        if rejects_credentials(err) {
            ConnectionError::Unauthorized(message)
        } else {
            ConnectionError::Transport(message)
        }
    }

    /// Classify a failure known only by its message.
    pub fn from_transport_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_unauthorized(&message) {
            ConnectionError::Unauthorized(message)
        } else {
            ConnectionError::Transport(message)
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ConnectionError::Unauthorized(_))
    }
}

fn is_401(err: &reqwest::Error) -> bool {
    err.status() == Some(StatusCode::UNAUTHORIZED)
}

fn rejects_credentials(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(e) = err.downcast_ref::<reqwest::Error>() {
            if is_401(e) {
                return true;
            }
        } else if let Some(e) = err.downcast_ref::<StreamableHttpError<reqwest::Error>>() {
            match e {
                StreamableHttpError::AuthRequired(_) => return true,
                StreamableHttpError::Client(e) if is_401(e) => return true,
                _ => {}
            }
        } else if let Some(SseTransportError::Client(e)) =
            err.downcast_ref::<SseTransportError<reqwest::Error>>()
        {
            if is_401(e) {
                return true;
            }
        } else if is_unauthorized(&err.to_string()) {
            // Type-erased layers only keep the message
            return true;
        }
        current = err.source();
    }
    false
}

/// Status-line check on an error message. URLs and ports that happen to
/// contain `401` do not count.
pub fn is_unauthorized(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("401 unauthorized") || lower.contains("auth required")
}

impl From<OAuthError> for ConnectionError {
    fn from(err: OAuthError) -> Self {
        if err.is_storage() {
            ConnectionError::Storage(err.to_string())
        } else {
            ConnectionError::Authorization(err.to_string())
        }
    }
}
