use crate::error::{ConnectionError, Result};
use async_trait::async_trait;
use rmcp::model::{ClientRequest, PingRequest, PingRequestMethod};
use rmcp::service::{Peer, RoleClient, RunningService};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A live, initialized protocol session with one server.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Protocol-level ping, bounded by `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<()>;

    /// Shut the session down and release the transport. Idempotent.
    async fn close(&self);

    /// Request handle for the tool-invocation layer.
    fn peer(&self) -> Option<Peer<RoleClient>>;
}

/// [`McpSession`] backed by an rmcp client service.
pub struct RmcpSession {
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpSession {
    pub fn new(service: RunningService<RoleClient, ()>) -> Self {
        Self {
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn ping(&self, timeout: Duration) -> Result<()> {
        let request = ClientRequest::PingRequest(PingRequest {
            method: PingRequestMethod,
            extensions: Default::default(),
        });

        match tokio::time::timeout(timeout, self.peer.send_request(request)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Liveness(e.to_string())),
            Err(_) => Err(ConnectionError::Liveness(format!(
                "ping timed out after {:?}",
                timeout
            ))),
        }
    }

    async fn close(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            match service.cancel().await {
                Ok(reason) => debug!("MCP session closed: {:?}", reason),
                Err(e) => debug!("MCP session task ended abnormally: {}", e),
            }
        }
    }

    fn peer(&self) -> Option<Peer<RoleClient>> {
        Some(self.peer.clone())
    }
}
