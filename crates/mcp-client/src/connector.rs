use crate::error::{ConnectionError, Result};
use crate::logging::ServerLogger;
use crate::session::{McpSession, RmcpSession};
use crate::transport::{http, sse, stdio, LoggedTransport};
use async_trait::async_trait;
use mcp_types::{ServerConfig, TransportDescriptor};
use rmcp::service::{self, RoleClient, RunningService};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything needed for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub server_name: String,
    pub config: ServerConfig,
    /// Resolved transport for `config`.
    pub transport: TransportDescriptor,
    /// OAuth access token to present, for remote servers.
    pub bearer_token: Option<String>,
    pub logger: ServerLogger,
}

/// Builds a client and transport for a server and performs the protocol
/// handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn McpSession>>;
}

/// [`Connector`] backed by the rmcp SDK transports.
#[derive(Debug, Clone)]
pub struct RmcpConnector {
    handshake_timeout: Duration,
}

impl Default for RmcpConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl RmcpConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn handshake<F, E>(&self, serving: F) -> Result<RunningService<RoleClient, ()>>
    where
        F: Future<Output = std::result::Result<RunningService<RoleClient, ()>, E>>,
        E: StdError + 'static,
    {
        match tokio::time::timeout(self.handshake_timeout, serving).await {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(e)) => Err(ConnectionError::from_transport_error(&e)),
            Err(_) => Err(ConnectionError::Transport(format!(
                "handshake timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn McpSession>> {
        let ConnectRequest {
            server_name,
            config,
            transport,
            bearer_token,
            logger,
        } = request;

        debug!(server = %server_name, "Connecting via {}", transport.kind());

        let service = match (&config, &transport) {
            (ServerConfig::Process(process), TransportDescriptor::Stdio { .. }) => {
                let child = stdio::spawn(process, &logger)?;
                self.handshake(service::serve_client((), LoggedTransport::new(child, logger.clone())))
                    .await?
            }
            (ServerConfig::Remote(remote), TransportDescriptor::Sse { url }) => {
                let client = http::build_http_client(&remote.headers, bearer_token.as_deref())?;
                let sse = sse::connect(url, client).await?;
                self.handshake(service::serve_client((), LoggedTransport::new(sse, logger.clone())))
                    .await?
            }
            (ServerConfig::Remote(remote), TransportDescriptor::StreamableHttp { url }) => {
                let client = http::build_http_client(&remote.headers, bearer_token.as_deref())?;
                let streamable = http::streamable_http(url, client);
                self.handshake(service::serve_client(
                    (),
                    LoggedTransport::new(streamable, logger.clone()),
                ))
                .await?
            }
            _ => {
                return Err(ConnectionError::Configuration(format!(
                    "transport {} does not match server configuration",
                    transport.kind()
                )))
            }
        };

        info!(server = %server_name, "Connected via {}", transport.kind());
        logger.info(format!("Connected via {}", transport.kind()));

        Ok(Arc::new(RmcpSession::new(service)))
    }
}
