use crate::discovery::{discover_server_metadata, register_client};
use crate::pkce::generate_pkce_challenge;
use crate::provider::OAuthClientProvider;
use crate::types::{
    InvalidationScope, OAuthClientInformation, OAuthServerMetadata, OAuthTokens, TokenResponse,
};
use crate::{OAuthError, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Drives the authorization-code grant against one server's authorization
/// server, persisting everything through an [`OAuthClientProvider`].
pub struct OAuthAuthorizer {
    http: Client,
    server_url: String,
    provider: Arc<dyn OAuthClientProvider>,
    metadata: OnceCell<OAuthServerMetadata>,
}

impl OAuthAuthorizer {
    pub fn new(http: Client, server_url: impl Into<String>, provider: Arc<dyn OAuthClientProvider>) -> Self {
        Self {
            http,
            server_url: server_url.into(),
            provider,
            metadata: OnceCell::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn OAuthClientProvider> {
        &self.provider
    }

    pub async fn server_metadata(&self) -> Result<&OAuthServerMetadata> {
        self.metadata
            .get_or_try_init(|| discover_server_metadata(&self.http, &self.server_url))
            .await
    }

    /// A usable access token, if one is stored or can be refreshed.
    ///
    /// Expired tokens that cannot be refreshed are dropped so the next
    /// unauthorized response starts a fresh authorization.
    pub async fn access_token(&self) -> Result<Option<String>> {
        let Some(tokens) = self.provider.tokens().await else {
            return Ok(None);
        };

        if !tokens.is_expired() {
            return Ok(Some(tokens.access_token));
        }

        if tokens.refresh_token.is_some() {
            match self.refresh(&tokens).await {
                Ok(refreshed) => return Ok(Some(refreshed.access_token)),
                Err(e) => warn!("Token refresh failed, discarding stored tokens: {}", e),
            }
        } else {
            debug!("Stored access token expired and has no refresh token");
        }

        self.provider
            .invalidate_credentials(InvalidationScope::Tokens)
            .await?;
        Ok(None)
    }

    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthError::TokenRefresh("No refresh token available".to_string()))?;
        let client = self
            .provider
            .client_information()
            .await
            .ok_or(OAuthError::MissingClientInformation)?;
        let metadata = self.server_metadata().await?;

        info!("Refreshing access token");

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("client_id", client.client_id.as_str());
        form.insert("refresh_token", refresh_token);
        if let Some(secret) = client.client_secret.as_deref() {
            form.insert("client_secret", secret);
        }
        if let Some(scope) = tokens.scope.as_deref() {
            form.insert("scope", scope);
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenRefresh(format!(
                "Token refresh failed with status {}: {}",
                status, error_body
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        let refreshed = OAuthTokens::from_response(token_response, tokens.refresh_token.clone());
        self.provider.save_tokens(&refreshed).await?;
        Ok(refreshed)
    }

    /// Stored client registration if it still matches the current redirect
    /// URL, otherwise a fresh dynamic registration.
    pub async fn ensure_client(&self) -> Result<OAuthClientInformation> {
        let redirect_url = self.provider.redirect_url();

        if let Some(info) = self.provider.client_information().await {
            if info.accepts_redirect(&redirect_url) {
                return Ok(info);
            }
            info!("Redirect URL changed to {}, re-registering OAuth client", redirect_url);
        }

        let metadata = self.server_metadata().await?;
        if metadata.registration_endpoint.is_none() {
            return Err(OAuthError::InvalidConfiguration(
                "No client information available and server does not support dynamic registration"
                    .to_string(),
            ));
        }

        let info = register_client(&self.http, metadata, &self.provider.client_metadata()).await?;
        self.provider.save_client_information(&info).await?;
        Ok(info)
    }

    /// Prepare PKCE material and send the user to the authorization endpoint.
    pub async fn begin_authorization(&self) -> Result<()> {
        let client = self.ensure_client().await?;
        let metadata = self.server_metadata().await?;
        let pkce = generate_pkce_challenge();

        self.provider.save_code_verifier(&pkce.code_verifier).await?;

        let mut auth_url = url::Url::parse(&metadata.authorization_endpoint)?;
        {
            let mut query = auth_url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &client.client_id);
            query.append_pair("redirect_uri", &self.provider.redirect_url());
            query.append_pair("state", self.provider.state());
            query.append_pair("code_challenge", &pkce.code_challenge);
            query.append_pair("code_challenge_method", &pkce.code_challenge_method);
            if let Some(scope) = self.provider.client_metadata().scope {
                query.append_pair("scope", &scope);
            }
        }

        debug!("Authorization URL: {}", auth_url);
        self.provider.redirect_to_authorization(auth_url.as_str()).await
    }

    /// Exchange the authorization code for tokens. The verifier is single-use
    /// and is removed whether or not the exchange succeeds.
    pub async fn finish_authorization(&self, code: &str) -> Result<OAuthTokens> {
        let verifier = self.provider.code_verifier().await?;
        let result = self.exchange_code(code, &verifier).await;

        if let Err(e) = self
            .provider
            .invalidate_credentials(InvalidationScope::Verifier)
            .await
        {
            warn!("Failed to remove used code verifier: {}", e);
        }

        let tokens = result?;
        self.provider.save_tokens(&tokens).await?;
        info!("OAuth authorization completed");
        Ok(tokens)
    }

    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<OAuthTokens> {
        let client = self
            .provider
            .client_information()
            .await
            .ok_or(OAuthError::MissingClientInformation)?;
        let metadata = self.server_metadata().await?;
        let redirect_url = self.provider.redirect_url();

        info!("Exchanging authorization code for access token");

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("client_id", client.client_id.as_str());
        form.insert("code", code);
        form.insert("redirect_uri", redirect_url.as_str());
        form.insert("code_verifier", verifier);
        if let Some(secret) = client.client_secret.as_deref() {
            form.insert("client_secret", secret);
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenExchange(format!(
                "Token exchange failed with status {}: {}",
                status, error_body
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        Ok(OAuthTokens::from_response(token_response, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserOpener;
    use crate::provider::StoreBackedProvider;
    use crate::storage::CredentialStore;
    use crate::types::CredentialFile;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingBrowser {
        opened: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrowserOpener for RecordingBrowser {
        async fn open(&self, url: &str) -> Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: CredentialStore,
        browser: Arc<RecordingBrowser>,
        authorizer: OAuthAuthorizer,
    }

    fn fixture(server: &MockServer) -> Fixture {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let browser = Arc::new(RecordingBrowser::default());
        let provider = StoreBackedProvider::new("svc", store.clone(), browser.clone())
            .with_callback("localhost", 4000)
            .with_state("state-1");
        let authorizer = OAuthAuthorizer::new(
            Client::new(),
            format!("{}/mcp", server.uri()),
            Arc::new(provider),
        );
        Fixture {
            _dir: dir,
            store,
            browser,
            authorizer,
        }
    }

    async fn mount_registration(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "client-1"
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn expired_tokens(refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: "old".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: refresh.map(str::to_string),
            scope: None,
            expires_at: Some(Utc::now() - Duration::minutes(5)),
        }
    }

    #[tokio::test]
    async fn test_begin_authorization_registers_and_redirects_once() {
        let server = MockServer::start().await;
        mount_registration(&server, 1).await;
        let fx = fixture(&server);

        fx.authorizer.begin_authorization().await.unwrap();

        let opened = fx.browser.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        let url = url::Url::parse(&opened[0]).unwrap();
        assert_eq!(url.path(), "/authorize");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "client-1");
        assert_eq!(query["state"], "state-1");
        assert_eq!(query["redirect_uri"], "http://localhost:4000/oauth/callback");
        assert_eq!(query["code_challenge_method"], "S256");

        let verifier = fx
            .store
            .read("svc", CredentialFile::CodeVerifier)
            .await
            .unwrap();
        assert_eq!(query["code_challenge"], crate::pkce::code_challenge_for(&verifier));

        // Same redirect URL: stored registration is reused.
        fx.authorizer.ensure_client().await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_redirect_reregisters() {
        let server = MockServer::start().await;
        mount_registration(&server, 2).await;
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let provider = Arc::new(
            StoreBackedProvider::new("svc", store, Arc::new(RecordingBrowser::default()))
                .with_callback("localhost", 4000),
        );
        let authorizer = OAuthAuthorizer::new(
            Client::new(),
            format!("{}/mcp", server.uri()),
            provider.clone(),
        );

        authorizer.ensure_client().await.unwrap();
        provider.set_callback_port(4001);
        let info = authorizer.ensure_client().await.unwrap();
        assert_eq!(info.redirect_uris, vec!["http://localhost:4001/oauth/callback"]);
    }

    #[tokio::test]
    async fn test_finish_authorization_exchanges_and_clears_verifier() {
        let server = MockServer::start().await;
        mount_registration(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-token",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let fx = fixture(&server);

        fx.authorizer.begin_authorization().await.unwrap();
        let tokens = fx.authorizer.finish_authorization("abc").await.unwrap();

        assert_eq!(tokens.access_token, "new-token");
        assert_eq!(
            fx.authorizer.access_token().await.unwrap().as_deref(),
            Some("new-token")
        );
        assert!(fx.store.read("svc", CredentialFile::CodeVerifier).await.is_none());

        // The verifier is single-use.
        assert!(matches!(
            fx.authorizer.finish_authorization("abc").await,
            Err(OAuthError::MissingVerifier)
        ));
    }

    #[tokio::test]
    async fn test_failed_exchange_still_clears_verifier() {
        let server = MockServer::start().await;
        mount_registration(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;
        let fx = fixture(&server);

        fx.authorizer.begin_authorization().await.unwrap();
        let err = fx.authorizer.finish_authorization("abc").await.unwrap_err();

        assert!(matches!(err, OAuthError::TokenExchange(_)));
        assert!(fx.store.read("svc", CredentialFile::CodeVerifier).await.is_none());
        assert!(fx.store.read("svc", CredentialFile::Tokens).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        let fx = fixture(&server);
        fx.store
            .write_json(
                "svc",
                CredentialFile::ClientInfo,
                &OAuthClientInformation::preregistered("client-1", None),
            )
            .await
            .unwrap();
        fx.store
            .write_json("svc", CredentialFile::Tokens, &expired_tokens(Some("r1")))
            .await
            .unwrap();

        assert_eq!(fx.authorizer.access_token().await.unwrap().as_deref(), Some("fresh"));

        let saved: OAuthTokens = fx.store.read_json("svc", CredentialFile::Tokens).await.unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.refresh_token.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_is_dropped() {
        let server = MockServer::start().await;
        let fx = fixture(&server);
        fx.store
            .write_json("svc", CredentialFile::Tokens, &expired_tokens(None))
            .await
            .unwrap();

        assert!(fx.authorizer.access_token().await.unwrap().is_none());
        assert!(fx.store.read("svc", CredentialFile::Tokens).await.is_none());
    }
}
