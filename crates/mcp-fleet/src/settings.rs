use crate::health::HealthPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Time between liveness checks of one server.
    pub health_interval: Duration,
    pub ping_timeout: Duration,
    /// Pause before each automatic reconnection attempt.
    pub reconnect_delay: Duration,
    /// Probe remote servers for OAuth metadata before connecting.
    pub oauth_autodetect: bool,
    pub callback_host: String,
    /// Preferred callback port; 0 lets the OS choose.
    pub callback_port: u16,
    /// How long to wait for the user to finish authorizing in the browser.
    pub auth_timeout: Duration,
    pub credential_dir: PathBuf,
    pub encrypt_credentials: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            oauth_autodetect: true,
            callback_host: "localhost".to_string(),
            callback_port: 0,
            auth_timeout: Duration::from_secs(300),
            credential_dir: default_credential_dir(),
            encrypt_credentials: true,
        }
    }
}

impl FleetSettings {
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_oauth_autodetect(mut self, enabled: bool) -> Self {
        self.oauth_autodetect = enabled;
        self
    }

    pub fn with_callback(mut self, host: impl Into<String>, port: u16) -> Self {
        self.callback_host = host.into();
        self.callback_port = port;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_credential_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credential_dir = dir.into();
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypt_credentials = enabled;
        self
    }

    pub(crate) fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            interval: self.health_interval,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

/// `<config dir>/mcp-fleet/auth`, or `./.mcp-fleet/auth` when the platform
/// has no config directory.
pub fn default_credential_dir() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join("mcp-fleet").join("auth"),
        None => PathBuf::from(".mcp-fleet").join("auth"),
    }
}
