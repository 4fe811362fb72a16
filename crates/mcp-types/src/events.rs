//! One-way notifications published to the UI layer.

use crate::state::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line scoped to one external server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub server_name: String,
    pub is_external: bool,
}

impl ServerLogEvent {
    pub fn new(server_name: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            server_name: server_name.into(),
            is_external: true,
        }
    }
}

/// Change notification emitted whenever the registry replaces or drops a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RegistryEvent {
    Updated { state: ConnectionState },
    Removed { name: String },
}

impl RegistryEvent {
    pub fn server_name(&self) -> &str {
        match self {
            RegistryEvent::Updated { state } => &state.name,
            RegistryEvent::Removed { name } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_shape() {
        let event = ServerLogEvent::new("svc", LogLevel::Warn, "slow");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["serverName"], "svc");
        assert_eq!(json["level"], "warn");
        assert_eq!(json["isExternal"], true);
    }

    #[test]
    fn test_registry_event_name() {
        let removed = RegistryEvent::Removed {
            name: "gone".to_string(),
        };
        assert_eq!(removed.server_name(), "gone");
        assert_eq!(serde_json::to_value(&removed).unwrap()["event"], "removed");
    }
}
