//! MCP Fleet - connection lifecycle for externally configured MCP servers
//!
//! Keeps one connection per configured server: establishes it over the right
//! transport, runs the OAuth flow when a remote server asks for it, watches
//! liveness and reconnects after failures. State and log events are
//! published for the UI and tool-invocation layers.

pub mod config_diff;
pub mod error;
pub mod health;
pub mod log;
pub mod manager;
pub mod registry;
pub mod settings;
pub mod watch;

pub use config_diff::ConfigDiff;
pub use error::{FleetError, Result};
pub use health::{HealthPolicy, HealthScheduler, HealthTarget};
pub use log::BroadcastLogSink;
pub use manager::ConnectionManager;
pub use registry::ServerRegistry;
pub use settings::{default_credential_dir, FleetSettings};
pub use watch::{load_config, ConfigWatcher};

// Domain types callers need alongside the manager
pub use mcp_types::{
    ConnectionState, ConnectionStatus, ParsedConfig, RegistryEvent, ServerLogEvent,
    TransportDescriptor,
};
