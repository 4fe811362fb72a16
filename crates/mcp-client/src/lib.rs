//! MCP Client - protocol sessions over rmcp transports
//!
//! Turns a validated server entry into a live, initialized rmcp client
//! session: process spawn or HTTP client construction, transport selection
//! from the URL, frame logging, and classification of failures into the
//! connection error taxonomy.

pub mod connector;
pub mod error;
pub mod logging;
pub mod session;
pub mod transport;

pub use connector::{ConnectRequest, Connector, RmcpConnector};
pub use error::{is_unauthorized, ConnectionError, Result};
pub use logging::{LogSink, NullSink, ServerLogger};
pub use session::{McpSession, RmcpSession};
pub use transport::{describe, resolve_remote_transport};

// Re-export rmcp handle types for the tool-invocation layer
pub use rmcp::service::{Peer, RoleClient};
