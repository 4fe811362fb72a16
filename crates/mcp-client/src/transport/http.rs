use crate::error::{ConnectionError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::StreamableHttpClientTransport;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client carrying the configured headers and, when present, the OAuth
/// bearer token on every request.
///
/// No overall request timeout is set: SSE streams stay open indefinitely.
pub fn build_http_client(
    headers: &BTreeMap<String, String>,
    bearer_token: Option<&str>,
) -> Result<reqwest::Client> {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_str(key).map_err(|e| {
            ConnectionError::Configuration(format!("invalid header name '{}': {}", key, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            ConnectionError::Configuration(format!("invalid value for header '{}': {}", key, e))
        })?;
        header_map.insert(name, value);
    }

    if let Some(token) = bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ConnectionError::Authorization(format!("unusable access token: {}", e)))?;
        value.set_sensitive(true);
        header_map.insert(AUTHORIZATION, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ConnectionError::Transport(format!("failed to build HTTP client: {}", e)))
}

pub fn streamable_http(
    url: &str,
    client: reqwest::Client,
) -> StreamableHttpClientTransport<reqwest::Client> {
    StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url.to_string()),
    )
}
