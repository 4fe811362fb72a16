use crate::authorizer::OAuthAuthorizer;
use crate::callback_server::{CallbackListener, CallbackOptions, LONG_POLL_TIMEOUT};
use crate::discovery::probe_oauth_support;
use crate::provider::{OAuthClientProvider, StoreBackedProvider};
use crate::types::OAuthTokens;
use crate::{OAuthError, Result};
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Upper bound on how long the user may take in the browser.
    pub auth_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(300),
        }
    }
}

/// Wires the callback listener and the client provider together for one
/// server and exposes the authorization flow as plain futures.
pub struct OAuthCoordinator {
    provider: Arc<StoreBackedProvider>,
    authorizer: OAuthAuthorizer,
    options: CoordinatorOptions,
    listener: Mutex<Option<Arc<CallbackListener>>>,
}

impl OAuthCoordinator {
    /// Capability probe against the server's well-known discovery URL.
    pub async fn needs_oauth(http: &Client, server_url: &str) -> bool {
        probe_oauth_support(http, server_url).await
    }

    pub fn new(
        http: Client,
        server_url: impl Into<String>,
        provider: Arc<StoreBackedProvider>,
        options: CoordinatorOptions,
    ) -> Self {
        let authorizer = OAuthAuthorizer::new(http, server_url, provider.clone());
        Self {
            provider,
            authorizer,
            options,
            listener: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<StoreBackedProvider> {
        &self.provider
    }

    pub fn authorizer(&self) -> &OAuthAuthorizer {
        &self.authorizer
    }

    /// Bearer token to attach before connecting, refreshing if needed.
    pub async fn access_token(&self) -> Result<Option<String>> {
        self.authorizer.access_token().await
    }

    fn current_listener(&self) -> Option<Arc<CallbackListener>> {
        self.listener.lock().ok().and_then(|guard| guard.clone())
    }

    /// Start the callback listener, returning the bound port. The provider's
    /// redirect URL follows the port actually bound.
    pub async fn start_listener(&self) -> Result<u16> {
        if let Some(listener) = self.current_listener() {
            return Ok(listener.port());
        }

        let listener = CallbackListener::bind(CallbackOptions {
            host: self.provider.callback_host().to_string(),
            port: self.provider.callback_port(),
            expected_state: Some(self.provider.state().to_string()),
            long_poll_timeout: LONG_POLL_TIMEOUT,
        })
        .await?;

        let port = listener.port();
        self.provider.set_callback_port(port);

        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(Arc::new(listener));
        }
        debug!(server = %self.provider.server_name(), "OAuth callback listener started on port {}", port);
        Ok(port)
    }

    /// Resolves with the authorization code once the browser redirect
    /// arrives, or fails after the configured timeout.
    pub async fn wait_for_authorization_code(&self) -> Result<String> {
        let listener = self.current_listener().ok_or_else(|| {
            OAuthError::CallbackServer("Callback listener is not running".to_string())
        })?;

        match tokio::time::timeout(self.options.auth_timeout, listener.wait_for_code()).await {
            Ok(response) => Ok(response?.code),
            Err(_) => {
                warn!(
                    server = %self.provider.server_name(),
                    "OAuth authorization timed out after {:?}",
                    self.options.auth_timeout
                );
                Err(OAuthError::AuthTimeout)
            }
        }
    }

    /// Full interactive flow: listener, browser redirect, code, token
    /// exchange. The listener is always closed afterwards.
    pub async fn authorize(&self) -> Result<OAuthTokens> {
        let result = async {
            self.start_listener().await?;
            self.authorizer.begin_authorization().await?;
            info!(server = %self.provider.server_name(), "Waiting for OAuth authorization in the browser");
            let code = self.wait_for_authorization_code().await?;
            self.authorizer.finish_authorization(&code).await
        }
        .await;

        self.close();
        result
    }

    pub fn close(&self) {
        let listener = self.listener.lock().ok().and_then(|mut guard| guard.take());
        if let Some(listener) = listener {
            listener.close();
        }
    }
}

impl Drop for OAuthCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserOpener;
    use crate::storage::CredentialStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Simulates the user approving access: follows the authorization URL's
    /// redirect_uri with a fixed code.
    struct ApprovingBrowser {
        opened: AtomicUsize,
        approve: bool,
    }

    #[async_trait]
    impl BrowserOpener for ApprovingBrowser {
        async fn open(&self, url: &str) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if !self.approve {
                return Ok(());
            }
            let url = url::Url::parse(url)?;
            let mut redirect = None;
            let mut state = None;
            for (k, v) in url.query_pairs() {
                match k.as_ref() {
                    "redirect_uri" => redirect = Some(v.into_owned()),
                    "state" => state = Some(v.into_owned()),
                    _ => {}
                }
            }
            let (Some(redirect), Some(state)) = (redirect, state) else {
                return Err(OAuthError::BrowserLaunch("bad authorization url".to_string()));
            };
            tokio::spawn(async move {
                let _ = reqwest::get(format!("{}?code=abc&state={}", redirect, state)).await;
            });
            Ok(())
        }
    }

    async fn oauth_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "client_id": "c1" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "granted",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        server
    }

    fn coordinator(
        server: &MockServer,
        browser: Arc<ApprovingBrowser>,
        auth_timeout: Duration,
    ) -> (TempDir, OAuthCoordinator) {
        let dir = tempdir().unwrap();
        let provider = StoreBackedProvider::new("svc", CredentialStore::new(dir.path()), browser)
            .with_callback("127.0.0.1", 0)
            .with_state("xyz");
        let coordinator = OAuthCoordinator::new(
            Client::new(),
            format!("{}/sse", server.uri()),
            Arc::new(provider),
            CoordinatorOptions { auth_timeout },
        );
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_wait_future_resolves_on_matching_callback() {
        let server = oauth_server().await;
        let browser = Arc::new(ApprovingBrowser {
            opened: AtomicUsize::new(0),
            approve: false,
        });
        let (_dir, coordinator) = coordinator(&server, browser, Duration::from_secs(5));

        let port = coordinator.start_listener().await.unwrap();
        assert_eq!(coordinator.provider().callback_port(), port);
        assert_eq!(coordinator.start_listener().await.unwrap(), port);

        tokio::spawn(async move {
            let _ = reqwest::get(format!(
                "http://127.0.0.1:{}/oauth/callback?code=abc&state=xyz",
                port
            ))
            .await;
        });

        assert_eq!(coordinator.wait_for_authorization_code().await.unwrap(), "abc");
        coordinator.close();
        coordinator.close();
    }

    #[tokio::test]
    async fn test_authorize_redirects_once_and_stores_tokens() {
        let server = oauth_server().await;
        let browser = Arc::new(ApprovingBrowser {
            opened: AtomicUsize::new(0),
            approve: true,
        });
        let (_dir, coordinator) = coordinator(&server, browser.clone(), Duration::from_secs(5));

        let tokens = coordinator.authorize().await.unwrap();

        assert_eq!(tokens.access_token, "granted");
        assert_eq!(browser.opened.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.access_token().await.unwrap().as_deref(),
            Some("granted")
        );
        assert!(coordinator.current_listener().is_none());
    }

    #[tokio::test]
    async fn test_authorize_times_out() {
        let server = oauth_server().await;
        let browser = Arc::new(ApprovingBrowser {
            opened: AtomicUsize::new(0),
            approve: false,
        });
        let (_dir, coordinator) = coordinator(&server, browser, Duration::from_millis(100));

        let err = coordinator.authorize().await.unwrap_err();
        assert!(matches!(err, OAuthError::AuthTimeout));
        assert!(coordinator.current_listener().is_none());
    }

    #[tokio::test]
    async fn test_wait_without_listener_fails() {
        let server = oauth_server().await;
        let browser = Arc::new(ApprovingBrowser {
            opened: AtomicUsize::new(0),
            approve: false,
        });
        let (_dir, coordinator) = coordinator(&server, browser, Duration::from_secs(1));
        assert!(coordinator.wait_for_authorization_code().await.is_err());
    }
}
