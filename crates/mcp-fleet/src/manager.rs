//! Connection lifecycle for every configured server.
//!
//! `connect` follows a fixed sequence. Running or stopped servers are left as
//! they are unless forced. Otherwise the server is marked `starting`, its
//! transport is resolved, and remote servers are probed for OAuth. The
//! connection is then attempted, with one authorization round and one retry
//! when the server answers "unauthorized". The outcome is recorded and the
//! health monitor takes over.

use crate::config_diff::{server_names, ConfigDiff};
use crate::error::{FleetError, Result};
use crate::health::{HealthScheduler, HealthTarget};
use crate::log::BroadcastLogSink;
use crate::registry::ServerRegistry;
use crate::settings::FleetSettings;
use async_trait::async_trait;
use futures::future::join_all;
use mcp_client::{
    describe, ConnectRequest, ConnectionError, Connector, McpSession, Peer, RmcpConnector,
    RoleClient, ServerLogger,
};
use mcp_oauth::{
    BrowserOpener, CoordinatorOptions, CredentialStore, OAuthCoordinator, StoreBackedProvider,
    SystemBrowser,
};
use mcp_types::{
    ConnectionState, ConnectionStatus, ParsedConfig, RegistryEvent, ServerConfig, ServerLogEvent,
    TransportDescriptor,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Owns the registry, the health monitors and the OAuth flows of a fleet of
/// servers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    me: Weak<ManagerInner>,
    settings: FleetSettings,
    registry: ServerRegistry,
    health: HealthScheduler,
    config: RwLock<ParsedConfig>,
    connector: Arc<dyn Connector>,
    browser: Arc<dyn BrowserOpener>,
    store: CredentialStore,
    http: reqwest::Client,
    logs: Arc<BroadcastLogSink>,
    connect_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// OAuth flows currently waiting on the browser, so a stop can release
    /// their callback listener.
    authorizations: Mutex<HashMap<String, Arc<OAuthCoordinator>>>,
}

impl ConnectionManager {
    /// Manager using the rmcp transports, the system browser and the
    /// credential directory from `settings`.
    pub fn new(settings: FleetSettings) -> Self {
        let store = CredentialStore::open(
            settings.credential_dir.clone(),
            settings.encrypt_credentials,
        );
        Self::with_components(
            settings,
            Arc::new(RmcpConnector::default()),
            Arc::new(SystemBrowser),
            store,
        )
    }

    pub fn with_components(
        settings: FleetSettings,
        connector: Arc<dyn Connector>,
        browser: Arc<dyn BrowserOpener>,
        store: CredentialStore,
    ) -> Self {
        let health = HealthScheduler::new(settings.health_policy());
        let inner = Arc::new_cyclic(|me| ManagerInner {
            me: me.clone(),
            settings,
            registry: ServerRegistry::new(),
            health,
            config: RwLock::new(ParsedConfig::default()),
            connector,
            browser,
            store,
            http: reqwest::Client::new(),
            logs: Arc::new(BroadcastLogSink::new()),
            connect_locks: Mutex::new(HashMap::new()),
            authorizations: Mutex::new(HashMap::new()),
        });
        Self { inner }
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    pub fn credential_store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// The configuration currently in effect.
    pub async fn config(&self) -> ParsedConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn state(&self, name: &str) -> Option<ConnectionState> {
        self.inner.registry.get(name).await
    }

    pub async fn states(&self) -> Vec<ConnectionState> {
        self.inner.registry.states().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.registry.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<ServerLogEvent> {
        self.inner.logs.subscribe()
    }

    /// Request handle for a running server.
    pub async fn peer(&self, name: &str) -> Option<Peer<RoleClient>> {
        self.inner.registry.session(name).await?.peer()
    }

    /// Connect one configured server. Connection failures are recorded on the
    /// returned state, not reported as errors.
    pub async fn connect(&self, name: &str, force: bool) -> Result<ConnectionState> {
        self.inner.connect(name, force).await
    }

    /// Connect every configured server that is not already running or
    /// stopped.
    pub async fn connect_all(&self) -> Vec<ConnectionState> {
        let names = server_names(&*self.inner.config.read().await);
        let results = join_all(names.iter().map(|name| self.inner.connect(name, false))).await;
        results.into_iter().filter_map(|r| r.ok()).collect()
    }

    pub async fn reconnect(&self, name: &str) -> Result<ConnectionState> {
        self.inner.connect(name, true).await
    }

    /// Disconnect a server and keep it disconnected until an explicit
    /// reconnect.
    pub async fn stop(&self, name: &str) -> Result<ConnectionState> {
        self.inner.stop(name).await
    }

    /// Stop the server and delete every stored credential for it.
    pub async fn revoke(&self, name: &str) -> Result<()> {
        match self.inner.stop(name).await {
            Ok(_) | Err(FleetError::UnknownServer(_)) => {}
            Err(e) => return Err(e),
        }
        self.inner.store.remove_server(name).await?;
        info!(server = %name, "Revoked stored credentials");
        Ok(())
    }

    /// Make `config` the configuration in effect. Removed servers are
    /// disconnected and dropped, new ones connected, changed ones reconnected.
    pub async fn apply_config(&self, config: ParsedConfig) -> ConfigDiff {
        self.inner.apply_config(config).await
    }

    /// Cancel every health monitor and close every session and OAuth flow.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.health.stop_all().await;
        inner.release_all_authorizations();

        for name in inner.registry.names().await {
            if let Some((_, Some(session))) = inner.registry.stop(&name).await {
                session.close().await;
            }
        }
        info!("Connection manager shut down");
    }
}

impl ManagerInner {
    fn logger(&self, name: &str) -> ServerLogger {
        ServerLogger::new(name, self.logs.clone())
    }

    fn connect_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.connect_locks.lock() {
            Ok(mut locks) => locks.entry(name.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn release_authorization(&self, name: &str) {
        let coordinator = self
            .authorizations
            .lock()
            .ok()
            .and_then(|mut flows| flows.remove(name));
        if let Some(coordinator) = coordinator {
            coordinator.close();
        }
    }

    fn release_all_authorizations(&self) {
        let flows: Vec<_> = self
            .authorizations
            .lock()
            .map(|mut flows| flows.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();
        for coordinator in flows {
            coordinator.close();
        }
    }

    async fn current(&self, name: &str) -> Result<ConnectionState> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))
    }

    /// Latest configuration for `name`; `Err` carries why it cannot be used.
    async fn resolve(
        &self,
        name: &str,
    ) -> Result<std::result::Result<(ServerConfig, TransportDescriptor), ConnectionError>> {
        let config = self.config.read().await;
        if let Some(server) = config.servers.get(name) {
            return Ok(describe(server).map(|transport| (server.clone(), transport)));
        }
        match config.violation(name) {
            Some(violation) => Ok(Err(ConnectionError::Configuration(violation.to_string()))),
            None => Err(FleetError::UnknownServer(name.to_string())),
        }
    }

    async fn connect(&self, name: &str, force: bool) -> Result<ConnectionState> {
        self.connect_with(name, force, false).await
    }

    /// `from_monitor` marks reconnections issued by the health monitor,
    /// which never override a failure waiting on the user.
    async fn connect_with(
        &self,
        name: &str,
        force: bool,
        from_monitor: bool,
    ) -> Result<ConnectionState> {
        if !self.config.read().await.contains(name) {
            return Err(FleetError::UnknownServer(name.to_string()));
        }

        let seen = self.registry.revision(name).await;
        let lock = self.connect_lock(name);
        let _guard = lock.lock().await;

        if from_monitor && self.registry.awaits_user(name).await {
            debug!(server = %name, "Last attempt needs the user, not reconnecting");
            return self.current(name).await;
        }

        if !force {
            if let Some(current) = self.registry.get(name).await {
                if current.is_running() || current.is_stopped() {
                    debug!(server = %name, "Already {}, nothing to do", current.status);
                    return Ok(current);
                }
                if self.registry.revision(name).await != seen {
                    debug!(server = %name, "Another connection attempt finished while waiting");
                    return Ok(current);
                }
            }
        }

        let resolved = self.resolve(name).await?;
        let transport = resolved.as_ref().ok().map(|(_, t)| t.clone());

        let (attempt, starting, previous) = self.registry.begin_attempt(name, transport).await;
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.release_authorization(name);

        let logger = self.logger(name);
        logger.info("Connecting");

        let outcome = match resolved {
            Ok((server, transport)) => self
                .establish(name, &server, &transport, &logger)
                .await
                .map(|session| (session, transport)),
            Err(e) => Err(e),
        };

        let state = match outcome {
            Ok((session, transport)) => {
                let running = starting.into_running(transport);
                if !self
                    .registry
                    .finish_attempt(attempt, running.clone(), Some(session.clone()))
                    .await
                {
                    session.close().await;
                    return self.current(name).await;
                }
                logger.info("Server is running");
                running
            }
            Err(e) => {
                logger.error(format!("Connection failed: {}", e));
                let failed = starting.into_error(e.to_string());
                let recorded = if matches!(e, ConnectionError::Authorization(_)) {
                    logger.warn("Authorization did not complete, connect again to retry");
                    self.registry.finish_awaiting_user(attempt, failed.clone()).await
                } else {
                    self.registry.finish_attempt(attempt, failed.clone(), None).await
                };
                if !recorded {
                    return self.current(name).await;
                }
                failed
            }
        };

        self.health.ensure(name, self.me.clone());
        Ok(state)
    }

    async fn establish(
        &self,
        name: &str,
        server: &ServerConfig,
        transport: &TransportDescriptor,
        logger: &ServerLogger,
    ) -> std::result::Result<Arc<dyn McpSession>, ConnectionError> {
        let coordinator = self.oauth_for(name, server, logger).await;
        let bearer_token = match &coordinator {
            Some(coordinator) => coordinator.access_token().await?,
            None => None,
        };

        let request = ConnectRequest {
            server_name: name.to_string(),
            config: server.clone(),
            transport: transport.clone(),
            bearer_token,
            logger: logger.clone(),
        };

        match self.connector.connect(request.clone()).await {
            Err(e) if e.is_unauthorized() => match coordinator {
                Some(coordinator) => self.authorize_and_retry(name, coordinator, request).await,
                None => {
                    logger.warn("Server requires authorization but does not advertise OAuth");
                    Err(e)
                }
            },
            other => other,
        }
    }

    /// OAuth coordinator for remote servers that advertise OAuth metadata.
    async fn oauth_for(
        &self,
        name: &str,
        server: &ServerConfig,
        logger: &ServerLogger,
    ) -> Option<Arc<OAuthCoordinator>> {
        let ServerConfig::Remote(remote) = server else {
            return None;
        };
        if !self.settings.oauth_autodetect {
            return None;
        }
        if !OAuthCoordinator::needs_oauth(&self.http, &remote.url).await {
            debug!(server = %name, "No OAuth metadata advertised");
            return None;
        }

        logger.info("OAuth enabled for this server");
        let provider = StoreBackedProvider::new(name, self.store.clone(), self.browser.clone())
            .with_callback(self.settings.callback_host.clone(), self.settings.callback_port);

        Some(Arc::new(OAuthCoordinator::new(
            self.http.clone(),
            remote.url.clone(),
            Arc::new(provider),
            CoordinatorOptions {
                auth_timeout: self.settings.auth_timeout,
            },
        )))
    }

    async fn authorize_and_retry(
        &self,
        name: &str,
        coordinator: Arc<OAuthCoordinator>,
        request: ConnectRequest,
    ) -> std::result::Result<Arc<dyn McpSession>, ConnectionError> {
        request
            .logger
            .info("Server requires authorization, opening browser");

        if let Ok(mut flows) = self.authorizations.lock() {
            flows.insert(name.to_string(), coordinator.clone());
        }
        let authorized = coordinator.authorize().await;
        if let Ok(mut flows) = self.authorizations.lock() {
            if flows
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &coordinator))
            {
                flows.remove(name);
            }
        }

        let tokens = authorized?;
        request.logger.info("Authorization complete, reconnecting");

        self.connector
            .connect(ConnectRequest {
                bearer_token: Some(tokens.access_token),
                ..request
            })
            .await
    }

    async fn stop(&self, name: &str) -> Result<ConnectionState> {
        // Timer first, so nothing reconnects behind our back
        self.health.stop(name).await;
        self.release_authorization(name);

        let (state, session) = self
            .registry
            .stop(name)
            .await
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))?;
        if let Some(session) = session {
            session.close().await;
        }

        self.logger(name).info("Server stopped");
        Ok(state)
    }

    async fn remove(&self, name: &str) {
        self.health.stop(name).await;
        self.release_authorization(name);

        if let Some(Some(session)) = self.registry.remove(name).await {
            session.close().await;
        }
        if let Ok(mut locks) = self.connect_locks.lock() {
            locks.remove(name);
        }
        info!(server = %name, "Server removed from configuration");
    }

    async fn apply_config(&self, config: ParsedConfig) -> ConfigDiff {
        for violation in &config.violations {
            warn!(server = %violation.server, "Invalid server configuration: {}", violation);
        }

        let diff = {
            let mut current = self.config.write().await;
            let diff = ConfigDiff::between(&current, &config);
            *current = config;
            diff
        };

        if diff.is_empty() {
            debug!("Configuration unchanged");
            return diff;
        }
        info!(
            "Applying configuration: {} added, {} removed, {} changed",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );

        for name in &diff.removed {
            self.remove(name).await;
        }

        let connects = diff
            .added
            .iter()
            .map(|name| (name, false))
            .chain(diff.changed.iter().map(|name| (name, true)))
            .map(|(name, force)| async move { (name, self.connect(name, force).await) });

        for (name, result) in join_all(connects).await {
            if let Err(e) = result {
                warn!(server = %name, "Could not apply configuration: {}", e);
            }
        }

        diff
    }
}

#[async_trait]
impl HealthTarget for ManagerInner {
    async fn status(&self, server: &str) -> Option<ConnectionStatus> {
        self.registry.status(server).await
    }

    async fn ping(&self, server: &str) -> std::result::Result<(), ConnectionError> {
        match self.registry.session(server).await {
            Some(session) => session.ping(self.settings.ping_timeout).await,
            None => Err(ConnectionError::Liveness("no live session".to_string())),
        }
    }

    async fn awaits_user(&self, server: &str) -> bool {
        self.registry.awaits_user(server).await
    }

    async fn mark_healthy(&self, server: &str) {
        if self.registry.clear_error(server).await.is_some() {
            debug!(server = %server, "Cleared stale error");
        }
    }

    async fn mark_unhealthy(&self, server: &str, error: &ConnectionError) {
        if let Some((_, session)) = self.registry.mark_failed(server, &error.to_string()).await {
            self.logger(server)
                .error(format!("Health check failed: {}", error));
            if let Some(session) = session {
                session.close().await;
            }
        }
    }

    async fn reconnect(&self, server: &str) {
        match self.connect_with(server, true, true).await {
            Ok(state) if state.status == ConnectionStatus::Error => {
                debug!(server = %server, "Reconnection failed, will retry");
            }
            Ok(_) => {}
            Err(e) => debug!(server = %server, "Reconnection skipped: {}", e),
        }
    }
}
