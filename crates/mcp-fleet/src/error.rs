use mcp_oauth::OAuthError;
use mcp_types::ConfigError;

pub type Result<T> = std::result::Result<T, FleetError>;

/// Failures surfaced by the connection manager itself. Per-server
/// connection failures are not errors here; they are recorded on the
/// server's `ConnectionState`.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credentials(#[from] OAuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config watcher error: {0}")]
    Watch(#[from] notify::Error),
}
