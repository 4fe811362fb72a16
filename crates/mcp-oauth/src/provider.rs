use crate::browser::BrowserOpener;
use crate::callback_server::CALLBACK_PATH;
use crate::storage::CredentialStore;
use crate::types::{
    ClientMetadata, CredentialFile, InvalidationScope, OAuthClientInformation, OAuthTokens,
};
use crate::{OAuthError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Capabilities an OAuth-aware transport needs from its host application.
#[async_trait]
pub trait OAuthClientProvider: Send + Sync {
    fn redirect_url(&self) -> String;

    fn client_metadata(&self) -> ClientMetadata;

    /// Anti-CSRF token, fixed for the lifetime of the provider.
    fn state(&self) -> &str;

    async fn client_information(&self) -> Option<OAuthClientInformation>;

    async fn save_client_information(&self, info: &OAuthClientInformation) -> Result<()>;

    async fn tokens(&self) -> Option<OAuthTokens>;

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<()>;

    async fn save_code_verifier(&self, verifier: &str) -> Result<()>;

    /// Fails with [`OAuthError::MissingVerifier`] when nothing is stored.
    async fn code_verifier(&self) -> Result<String>;

    async fn redirect_to_authorization(&self, url: &str) -> Result<()>;

    async fn invalidate_credentials(&self, scope: InvalidationScope) -> Result<()>;
}

/// Provider persisting everything through a [`CredentialStore`].
///
/// Pre-registered client information, when supplied, replaces the stored
/// registration entirely and is never written to disk.
pub struct StoreBackedProvider {
    server_name: String,
    store: CredentialStore,
    browser: Arc<dyn BrowserOpener>,
    callback_host: String,
    callback_port: AtomicU16,
    state: String,
    static_client: Option<OAuthClientInformation>,
    metadata_overrides: Option<Map<String, Value>>,
}

impl StoreBackedProvider {
    pub fn new(
        server_name: impl Into<String>,
        store: CredentialStore,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            store,
            browser,
            callback_host: "localhost".to_string(),
            callback_port: AtomicU16::new(0),
            state: uuid::Uuid::new_v4().to_string(),
            static_client: None,
            metadata_overrides: None,
        }
    }

    pub fn with_callback(mut self, host: impl Into<String>, port: u16) -> Self {
        self.callback_host = host.into();
        self.callback_port = AtomicU16::new(port);
        self
    }

    pub fn with_static_client(mut self, info: OAuthClientInformation) -> Self {
        self.static_client = Some(info);
        self
    }

    pub fn with_metadata_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.metadata_overrides = Some(overrides);
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn callback_host(&self) -> &str {
        &self.callback_host
    }

    pub fn callback_port(&self) -> u16 {
        self.callback_port.load(Ordering::SeqCst)
    }

    /// Record the port the callback listener actually bound.
    pub fn set_callback_port(&self, port: u16) {
        self.callback_port.store(port, Ordering::SeqCst);
    }
}

#[async_trait]
impl OAuthClientProvider for StoreBackedProvider {
    fn redirect_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.callback_host,
            self.callback_port(),
            CALLBACK_PATH
        )
    }

    fn client_metadata(&self) -> ClientMetadata {
        let base = ClientMetadata::for_redirect(&self.redirect_url());
        match &self.metadata_overrides {
            Some(overrides) => base.merged_with(overrides).unwrap_or_else(|e| {
                warn!(server = %self.server_name, "Ignoring invalid client metadata overrides: {}", e);
                ClientMetadata::for_redirect(&self.redirect_url())
            }),
            None => base,
        }
    }

    fn state(&self) -> &str {
        &self.state
    }

    async fn client_information(&self) -> Option<OAuthClientInformation> {
        if let Some(info) = &self.static_client {
            return Some(info.clone());
        }
        self.store
            .read_json(&self.server_name, CredentialFile::ClientInfo)
            .await
    }

    async fn save_client_information(&self, info: &OAuthClientInformation) -> Result<()> {
        if self.static_client.is_some() {
            debug!(server = %self.server_name, "Static client information in use; not persisting registration");
            return Ok(());
        }
        self.store
            .write_json(&self.server_name, CredentialFile::ClientInfo, info)
            .await
    }

    async fn tokens(&self) -> Option<OAuthTokens> {
        self.store
            .read_json(&self.server_name, CredentialFile::Tokens)
            .await
    }

    async fn save_tokens(&self, tokens: &OAuthTokens) -> Result<()> {
        self.store
            .write_json(&self.server_name, CredentialFile::Tokens, tokens)
            .await
    }

    async fn save_code_verifier(&self, verifier: &str) -> Result<()> {
        self.store
            .write(&self.server_name, CredentialFile::CodeVerifier, verifier)
            .await
    }

    async fn code_verifier(&self) -> Result<String> {
        self.store
            .read(&self.server_name, CredentialFile::CodeVerifier)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(OAuthError::MissingVerifier)
    }

    async fn redirect_to_authorization(&self, url: &str) -> Result<()> {
        self.browser.open(url).await
    }

    async fn invalidate_credentials(&self, scope: InvalidationScope) -> Result<()> {
        self.store.invalidate(&self.server_name, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingBrowser {
        opened: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl BrowserOpener for RecordingBrowser {
        async fn open(&self, url: &str) -> Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            if self.fail {
                Err(OAuthError::BrowserLaunch("no display".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn provider(root: &std::path::Path) -> StoreBackedProvider {
        StoreBackedProvider::new(
            "svc",
            CredentialStore::new(root),
            Arc::new(RecordingBrowser::default()),
        )
        .with_callback("localhost", 4567)
    }

    #[test]
    fn test_redirect_url_follows_bound_port() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        assert_eq!(provider.redirect_url(), "http://localhost:4567/oauth/callback");

        provider.set_callback_port(9999);
        assert_eq!(provider.redirect_url(), "http://localhost:9999/oauth/callback");
        assert_eq!(
            provider.client_metadata().redirect_uris,
            vec!["http://localhost:9999/oauth/callback"]
        );
    }

    #[test]
    fn test_state_is_fixed_per_instance() {
        let dir = tempdir().unwrap();
        let a = provider(dir.path());
        let b = provider(dir.path());
        assert_eq!(a.state(), a.state());
        assert_ne!(a.state(), b.state());
    }

    #[tokio::test]
    async fn test_missing_verifier_is_an_error() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());

        assert!(matches!(
            provider.code_verifier().await,
            Err(OAuthError::MissingVerifier)
        ));

        provider.save_code_verifier("v1").await.unwrap();
        assert_eq!(provider.code_verifier().await.unwrap(), "v1");

        provider
            .invalidate_credentials(InvalidationScope::Verifier)
            .await
            .unwrap();
        assert!(provider.code_verifier().await.is_err());
    }

    #[tokio::test]
    async fn test_static_client_short_circuits_storage() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path())
            .with_static_client(OAuthClientInformation::preregistered("static-id", None));

        let registered = OAuthClientInformation::preregistered("dynamic-id", None);
        provider.save_client_information(&registered).await.unwrap();

        assert_eq!(provider.client_information().await.unwrap().client_id, "static-id");
        assert!(CredentialStore::new(dir.path())
            .list_files("svc")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tokens_round_trip() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        assert!(provider.tokens().await.is_none());

        let tokens = OAuthTokens {
            access_token: "at".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            scope: None,
            expires_at: None,
        };
        provider.save_tokens(&tokens).await.unwrap();
        assert_eq!(provider.tokens().await, Some(tokens));
    }

    #[tokio::test]
    async fn test_redirect_failure_is_hard_error() {
        let dir = tempdir().unwrap();
        let browser = Arc::new(RecordingBrowser {
            fail: true,
            ..Default::default()
        });
        let provider = StoreBackedProvider::new("svc", CredentialStore::new(dir.path()), browser.clone());

        let err = provider
            .redirect_to_authorization("https://auth/authorize")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::BrowserLaunch(_)));
        assert_eq!(browser.opened.lock().unwrap().len(), 1);
    }
}
