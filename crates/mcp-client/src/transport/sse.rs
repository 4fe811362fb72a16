use crate::error::{ConnectionError, Result};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::SseClientTransport;

/// Open the SSE stream. A 401 on the initial GET is reported as
/// [`ConnectionError::Unauthorized`].
pub async fn connect(url: &str, client: reqwest::Client) -> Result<SseClientTransport<reqwest::Client>> {
    SseClientTransport::start_with_client(
        client,
        SseClientConfig {
            sse_endpoint: url.into(),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| ConnectionError::from_transport_error(&e))
}
