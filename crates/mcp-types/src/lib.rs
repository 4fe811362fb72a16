//! MCP Types - shared domain model for the fleet connection core
//!
//! This crate holds the serializable records exchanged between the connection
//! manager, the UI layer and the tool-invocation layer: parsed server
//! configuration, per-server connection state, and the outbound log/registry
//! events. Nothing in here owns a live socket or process handle.

pub mod config;
pub mod error;
pub mod events;
pub mod state;

pub use config::{
    ConfigViolation, ParsedConfig, ProcessConfig, RemoteConfig, ServerConfig, StderrMode,
    TransportHint,
};
pub use error::{ConfigError, Result};
pub use events::{LogLevel, RegistryEvent, ServerLogEvent};
pub use state::{ConnectionState, ConnectionStatus, TransportDescriptor};
