//! Per-server connection state as seen by the UI and tool-invocation layers.
//!
//! A [`ConnectionState`] is always replaced as a whole record. The transition
//! helpers consume the previous record and return the next one so callers never
//! mutate fields piecemeal.

use crate::config::{ProcessConfig, TransportHint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Starting,
    Running,
    Error,
    /// Intentionally not connected. Never reconnected automatically.
    Stopped,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Starting => "starting",
            ConnectionStatus::Running => "running",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Which transport carries a server's frames, with its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportDescriptor {
    Stdio { command: String, args: Vec<String> },
    Sse { url: String },
    StreamableHttp { url: String },
}

impl TransportDescriptor {
    pub fn remote(url: &str, kind: TransportHint) -> Self {
        match kind {
            TransportHint::Sse => TransportDescriptor::Sse {
                url: url.to_string(),
            },
            TransportHint::Http => TransportDescriptor::StreamableHttp {
                url: url.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportDescriptor::Stdio { .. } => "stdio",
            TransportDescriptor::Sse { .. } => "sse",
            TransportDescriptor::StreamableHttp { .. } => "streamable-http",
        }
    }
}

impl From<&ProcessConfig> for TransportDescriptor {
    fn from(config: &ProcessConfig) -> Self {
        TransportDescriptor::Stdio {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

/// Externally visible connection record. Live client handles are kept
/// elsewhere and never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub name: String,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_external: bool,
}

impl ConnectionState {
    /// Fresh record for a connection attempt that is about to begin.
    pub fn starting(name: impl Into<String>, transport: Option<TransportDescriptor>) -> Self {
        Self {
            name: name.into(),
            status: ConnectionStatus::Starting,
            transport,
            started_at: Some(Utc::now()),
            stopped_at: None,
            error: None,
            is_external: true,
        }
    }

    pub fn into_running(self, transport: TransportDescriptor) -> Self {
        Self {
            status: ConnectionStatus::Running,
            transport: Some(transport),
            error: None,
            stopped_at: None,
            ..self
        }
    }

    pub fn into_error(self, message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            error: Some(message.into()),
            stopped_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn into_stopped(self) -> Self {
        Self {
            status: ConnectionStatus::Stopped,
            stopped_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ConnectionStatus::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.status == ConnectionStatus::Stopped
    }
}
