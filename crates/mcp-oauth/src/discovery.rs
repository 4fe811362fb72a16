use crate::types::{ClientMetadata, OAuthClientInformation, OAuthServerMetadata};
use crate::{OAuthError, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheme, host and port of `server_url`, without a trailing slash.
pub fn origin_of(server_url: &str) -> Result<String> {
    let url = Url::parse(server_url)?;
    if !url.has_host() {
        return Err(OAuthError::InvalidConfiguration(format!(
            "URL has no host: {}",
            server_url
        )));
    }
    Ok(url.origin().ascii_serialization())
}

pub fn well_known_url(server_url: &str) -> Result<String> {
    Ok(format!("{}{}", origin_of(server_url)?, WELL_KNOWN_PATH))
}

/// Whether the server advertises OAuth. Any failure counts as "no".
pub async fn probe_oauth_support(http: &Client, server_url: &str) -> bool {
    let probe_url = match well_known_url(server_url) {
        Ok(url) => url,
        Err(e) => {
            debug!("Skipping OAuth probe for {}: {}", server_url, e);
            return false;
        }
    };

    match http.get(&probe_url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!("OAuth metadata found at {}", probe_url);
            true
        }
        Ok(resp) => {
            debug!("OAuth probe {} returned {}", probe_url, resp.status());
            false
        }
        Err(e) => {
            debug!("OAuth probe {} failed: {}", probe_url, e);
            false
        }
    }
}

/// Fetch RFC 8414 metadata, falling back to conventional endpoint paths on
/// the server origin when the document is unavailable.
pub async fn discover_server_metadata(http: &Client, server_url: &str) -> Result<OAuthServerMetadata> {
    let origin = origin_of(server_url)?;
    let metadata_url = format!("{}{}", origin, WELL_KNOWN_PATH);

    info!("Discovering OAuth server metadata from: {}", metadata_url);

    match http.get(&metadata_url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<OAuthServerMetadata>().await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => warn!("Malformed OAuth metadata document: {}", e),
        },
        Ok(resp) => warn!("OAuth metadata discovery failed with status: {}", resp.status()),
        Err(e) => warn!("OAuth metadata discovery request failed: {}", e),
    }

    Ok(fallback_metadata(&origin))
}

fn fallback_metadata(origin: &str) -> OAuthServerMetadata {
    info!("Using default OAuth endpoints for: {}", origin);

    OAuthServerMetadata {
        issuer: origin.to_string(),
        authorization_endpoint: format!("{}/authorize", origin),
        token_endpoint: format!("{}/token", origin),
        registration_endpoint: Some(format!("{}/register", origin)),
        scopes_supported: None,
        code_challenge_methods_supported: Some(vec!["S256".to_string()]),
        additional_metadata: HashMap::new(),
    }
}

/// Dynamic Client Registration (RFC 7591).
pub async fn register_client(
    http: &Client,
    server_metadata: &OAuthServerMetadata,
    client_metadata: &ClientMetadata,
) -> Result<OAuthClientInformation> {
    let registration_endpoint = server_metadata.registration_endpoint.as_ref().ok_or_else(|| {
        OAuthError::ClientRegistration(
            "Server does not support dynamic client registration".to_string(),
        )
    })?;

    info!("Registering OAuth client at: {}", registration_endpoint);
    debug!("Registration request: {:?}", client_metadata);

    let response = http
        .post(registration_endpoint)
        .json(client_metadata)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_body = response.text().await.unwrap_or_default();
        warn!("Client registration failed: {} - {}", status, error_body);
        return Err(OAuthError::ClientRegistration(format!(
            "Registration failed with status {}: {}",
            status, error_body
        )));
    }

    let mut info: OAuthClientInformation = response.json().await?;
    if info.redirect_uris.is_empty() {
        info.redirect_uris = client_metadata.redirect_uris.clone();
    }

    info!("Registered OAuth client: {}", info.client_id);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_origin_strips_path_and_keeps_port() {
        assert_eq!(origin_of("https://host/mcp").unwrap(), "https://host");
        assert_eq!(origin_of("http://host:8080/a/b/sse").unwrap(), "http://host:8080");
        assert!(origin_of("not a url").is_err());
    }

    #[test]
    fn test_fallback_metadata() {
        let metadata = fallback_metadata("https://example.com");
        assert_eq!(metadata.authorization_endpoint, "https://example.com/authorize");
        assert_eq!(metadata.token_endpoint, "https://example.com/token");
        assert_eq!(
            metadata.registration_endpoint.as_deref(),
            Some("https://example.com/register")
        );
    }

    #[tokio::test]
    async fn test_probe_reflects_status() {
        let server = MockServer::start().await;
        let http = Client::new();
        let mcp_url = format!("{}/sse", server.uri());

        assert!(!probe_oauth_support(&http, &mcp_url).await);

        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        assert!(probe_oauth_support(&http, &mcp_url).await);
    }

    #[tokio::test]
    async fn test_probe_network_failure_is_false() {
        let http = Client::new();
        assert!(!probe_oauth_support(&http, "http://127.0.0.1:1/mcp").await);
    }

    #[tokio::test]
    async fn test_discovery_uses_document_or_fallback() {
        let server = MockServer::start().await;
        let http = Client::new();
        let mcp_url = format!("{}/mcp", server.uri());

        let fallback = discover_server_metadata(&http, &mcp_url).await.unwrap();
        assert_eq!(fallback.token_endpoint, format!("{}/token", server.uri()));

        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/oauth2/auth", server.uri()),
                "token_endpoint": format!("{}/oauth2/token", server.uri()),
            })))
            .mount(&server)
            .await;

        let discovered = discover_server_metadata(&http, &mcp_url).await.unwrap();
        assert_eq!(discovered.token_endpoint, format!("{}/oauth2/token", server.uri()));
        assert!(discovered.registration_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_register_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "abc123",
                "client_id_issued_at": 1700000000u64
            })))
            .expect(1)
            .mount(&server)
            .await;

        let metadata = fallback_metadata(&server.uri());
        let client_metadata = ClientMetadata::for_redirect("http://localhost:1/oauth/callback");
        let info = register_client(&Client::new(), &metadata, &client_metadata)
            .await
            .unwrap();

        assert_eq!(info.client_id, "abc123");
        assert_eq!(info.redirect_uris, client_metadata.redirect_uris);
    }

    #[tokio::test]
    async fn test_register_client_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad metadata"))
            .mount(&server)
            .await;

        let err = register_client(
            &Client::new(),
            &fallback_metadata(&server.uri()),
            &ClientMetadata::for_redirect("http://localhost:1/oauth/callback"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, OAuthError::ClientRegistration(msg) if msg.contains("bad metadata")));
    }
}
