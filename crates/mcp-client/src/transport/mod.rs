//! Transport selection and construction for the three supported channels:
//! a local child process over stdio, Server-Sent Events, and streamable HTTP.
//!
//! Every transport is wrapped in [`LoggedTransport`] so protocol frames show up
//! as server-scoped log events.

use crate::error::{ConnectionError, Result};
use mcp_types::{RemoteConfig, ServerConfig, TransportDescriptor, TransportHint};

pub mod http;
pub mod logged;
pub mod sse;
pub mod stdio;

pub use logged::LoggedTransport;

/// Pick SSE or streamable HTTP for a URL entry. An explicit hint wins;
/// otherwise the last path segment must be `sse` or `mcp`.
pub fn resolve_remote_transport(url: &str, hint: Option<TransportHint>) -> Result<TransportHint> {
    let parsed = url::Url::parse(url)
        .map_err(|e| ConnectionError::Configuration(format!("invalid URL '{}': {}", url, e)))?;

    if let Some(hint) = hint {
        return Ok(hint);
    }

    let last_segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("");

    match last_segment {
        "sse" => Ok(TransportHint::Sse),
        "mcp" => Ok(TransportHint::Http),
        other => Err(ConnectionError::Configuration(format!(
            "cannot infer transport from URL '{}': path must end in /sse or /mcp (found '{}'); set \"transport\" explicitly",
            url, other
        ))),
    }
}

/// Describe the transport a server entry will use, without connecting.
pub fn describe(config: &ServerConfig) -> Result<TransportDescriptor> {
    match config {
        ServerConfig::Process(process) => Ok(TransportDescriptor::from(process)),
        ServerConfig::Remote(RemoteConfig { url, transport, .. }) => {
            let kind = resolve_remote_transport(url, *transport)?;
            Ok(TransportDescriptor::remote(url, kind))
        }
    }
}
