//! Process-wide table of per-server connection state.
//!
//! Every write replaces a server's whole [`ConnectionState`] and publishes a
//! [`RegistryEvent`]. Live sessions sit next to the record but are never part
//! of what readers see.
//!
//! Each record carries an attempt number that changes whenever a connection
//! attempt starts or the record is stopped. An attempt may only publish its
//! outcome if its number is still current, so a `stop()` racing an in-flight
//! connect always wins. A separate revision changes on every write.
//!
//! An attempt that failed for want of user authorization is parked: the
//! record says so until the next attempt begins, and the health monitor
//! leaves it alone.

use mcp_client::McpSession;
use mcp_types::{ConnectionState, ConnectionStatus, RegistryEvent, TransportDescriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Entry {
    state: ConnectionState,
    session: Option<Arc<dyn McpSession>>,
    attempt: u64,
    revision: u64,
    awaiting_user: bool,
}

pub struct ServerRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<RegistryEvent>,
    next_id: AtomicU64,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, name: &str) -> Option<ConnectionState> {
        self.entries.read().await.get(name).map(|e| e.state.clone())
    }

    pub async fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.entries.read().await.get(name).map(|e| e.state.status)
    }

    /// Snapshot of every record, ordered by server name.
    pub async fn states(&self) -> Vec<ConnectionState> {
        let mut states: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.state.clone())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Live session of a running server.
    pub async fn session(&self, name: &str) -> Option<Arc<dyn McpSession>> {
        let entries = self.entries.read().await;
        let entry = entries.get(name)?;
        if entry.state.is_running() {
            entry.session.clone()
        } else {
            None
        }
    }

    /// Whether the last attempt failed in a way only the user can resolve.
    pub async fn awaits_user(&self, name: &str) -> bool {
        self.entries
            .read()
            .await
            .get(name)
            .is_some_and(|e| e.awaiting_user)
    }

    /// Changes on every write to the server's record.
    pub async fn revision(&self, name: &str) -> Option<u64> {
        self.entries.read().await.get(name).map(|e| e.revision)
    }

    fn publish(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Replace the record with a fresh `starting` one. Returns the new
    /// attempt number and whatever session the previous record held.
    pub async fn begin_attempt(
        &self,
        name: &str,
        transport: Option<TransportDescriptor>,
    ) -> (u64, ConnectionState, Option<Arc<dyn McpSession>>) {
        let attempt = self.next_id();
        let state = ConnectionState::starting(name, transport);

        let previous = {
            let mut entries = self.entries.write().await;
            entries.insert(
                name.to_string(),
                Entry {
                    state: state.clone(),
                    session: None,
                    attempt,
                    revision: attempt,
                    awaiting_user: false,
                },
            )
        };

        self.publish(RegistryEvent::Updated {
            state: state.clone(),
        });
        (attempt, state, previous.and_then(|e| e.session))
    }

    /// Publish the outcome of `attempt`. Returns `false` without touching
    /// the record when the attempt has been superseded.
    pub async fn finish_attempt(
        &self,
        attempt: u64,
        state: ConnectionState,
        session: Option<Arc<dyn McpSession>>,
    ) -> bool {
        self.finish(attempt, state, session, false).await
    }

    /// Like [`finish_attempt`](Self::finish_attempt) for a failure that
    /// must not be retried until the user starts a new attempt.
    pub async fn finish_awaiting_user(&self, attempt: u64, state: ConnectionState) -> bool {
        self.finish(attempt, state, None, true).await
    }

    async fn finish(
        &self,
        attempt: u64,
        state: ConnectionState,
        session: Option<Arc<dyn McpSession>>,
        awaiting_user: bool,
    ) -> bool {
        let revision = self.next_id();
        {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&state.name) {
                Some(entry) if entry.attempt == attempt => {
                    *entry = Entry {
                        state: state.clone(),
                        session,
                        attempt,
                        revision,
                        awaiting_user,
                    };
                }
                _ => {
                    debug!(server = %state.name, "Discarding outcome of superseded connection attempt");
                    return false;
                }
            }
        }

        self.publish(RegistryEvent::Updated { state });
        true
    }

    /// Demote a running server to `error`, handing back its session.
    /// No-op unless the server is currently running.
    pub async fn mark_failed(
        &self,
        name: &str,
        message: &str,
    ) -> Option<(ConnectionState, Option<Arc<dyn McpSession>>)> {
        let revision = self.next_id();
        let (state, session) = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(name)?;
            if !entry.state.is_running() {
                return None;
            }
            let state = entry.state.clone().into_error(message);
            entry.state = state.clone();
            entry.revision = revision;
            (state, entry.session.take())
        };

        self.publish(RegistryEvent::Updated {
            state: state.clone(),
        });
        Some((state, session))
    }

    /// Clear a stale error left on a running server.
    pub async fn clear_error(&self, name: &str) -> Option<ConnectionState> {
        let revision = self.next_id();
        let state = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(name)?;
            if !entry.state.is_running() || entry.state.error.is_none() {
                return None;
            }
            let state = ConnectionState {
                error: None,
                ..entry.state.clone()
            };
            entry.state = state.clone();
            entry.revision = revision;
            state
        };

        self.publish(RegistryEvent::Updated {
            state: state.clone(),
        });
        Some(state)
    }

    /// Mark the server intentionally stopped and invalidate any in-flight
    /// attempt. Returns the session to close.
    pub async fn stop(&self, name: &str) -> Option<(ConnectionState, Option<Arc<dyn McpSession>>)> {
        let attempt = self.next_id();
        let (state, session) = {
            let mut entries = self.entries.write().await;
            let entry = entries.get_mut(name)?;
            let state = entry.state.clone().into_stopped();
            entry.state = state.clone();
            entry.attempt = attempt;
            entry.revision = attempt;
            (state, entry.session.take())
        };

        self.publish(RegistryEvent::Updated {
            state: state.clone(),
        });
        Some((state, session))
    }

    /// Drop the record entirely. Returns the session to close.
    pub async fn remove(&self, name: &str) -> Option<Option<Arc<dyn McpSession>>> {
        let removed = self.entries.write().await.remove(name)?;
        self.publish(RegistryEvent::Removed {
            name: name.to_string(),
        });
        Some(removed.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp_client::{Peer, RoleClient};
    use std::time::Duration;

    struct IdleSession;

    #[async_trait]
    impl McpSession for IdleSession {
        async fn ping(&self, _timeout: Duration) -> mcp_client::Result<()> {
            Ok(())
        }

        async fn close(&self) {}

        fn peer(&self) -> Option<Peer<RoleClient>> {
            None
        }
    }

    fn stdio() -> TransportDescriptor {
        TransportDescriptor::Stdio {
            command: "echo".to_string(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn test_attempt_lifecycle_publishes_whole_records() {
        let registry = ServerRegistry::new();
        let mut events = registry.subscribe();

        let (attempt, starting, previous) = registry.begin_attempt("svc", Some(stdio())).await;
        assert!(previous.is_none());
        let started = registry.revision("svc").await;
        assert_eq!(registry.status("svc").await, Some(ConnectionStatus::Starting));

        let running = starting.into_running(stdio());
        assert!(
            registry
                .finish_attempt(attempt, running.clone(), Some(Arc::new(IdleSession)))
                .await
        );
        assert!(registry.session("svc").await.is_some());
        assert_ne!(registry.revision("svc").await, started);

        match events.recv().await.unwrap() {
            RegistryEvent::Updated { state } => assert_eq!(state.status, ConnectionStatus::Starting),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Updated { state: running }
        );
    }

    #[tokio::test]
    async fn test_stop_supersedes_in_flight_attempt() {
        let registry = ServerRegistry::new();
        let (attempt, starting, _) = registry.begin_attempt("svc", Some(stdio())).await;

        let (stopped, _) = registry.stop("svc").await.unwrap();
        assert!(stopped.is_stopped());

        let applied = registry
            .finish_attempt(attempt, starting.into_running(stdio()), Some(Arc::new(IdleSession)))
            .await;
        assert!(!applied);
        assert_eq!(registry.status("svc").await, Some(ConnectionStatus::Stopped));
        assert!(registry.session("svc").await.is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_only_applies_to_running() {
        let registry = ServerRegistry::new();
        let (attempt, starting, _) = registry.begin_attempt("svc", Some(stdio())).await;
        assert!(registry.mark_failed("svc", "boom").await.is_none());

        registry
            .finish_attempt(attempt, starting.into_running(stdio()), Some(Arc::new(IdleSession)))
            .await;

        let (state, session) = registry.mark_failed("svc", "boom").await.unwrap();
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.stopped_at.is_some());
        assert!(session.is_some());
        assert!(registry.session("svc").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_error_on_running_record() {
        let registry = ServerRegistry::new();
        let (attempt, starting, _) = registry.begin_attempt("svc", Some(stdio())).await;
        let mut running = starting.into_running(stdio());
        running.error = Some("stale".to_string());
        registry.finish_attempt(attempt, running, None).await;

        let cleared = registry.clear_error("svc").await.unwrap();
        assert!(cleared.error.is_none());
        assert!(registry.clear_error("svc").await.is_none());
    }

    #[tokio::test]
    async fn test_awaiting_user_lasts_until_next_attempt() {
        let registry = ServerRegistry::new();
        let (attempt, starting, _) = registry.begin_attempt("svc", None).await;
        assert!(!registry.awaits_user("svc").await);

        let failed = starting.into_error("Authorization failed: timed out");
        assert!(registry.finish_awaiting_user(attempt, failed).await);
        assert_eq!(registry.status("svc").await, Some(ConnectionStatus::Error));
        assert!(registry.awaits_user("svc").await);

        registry.begin_attempt("svc", None).await;
        assert!(!registry.awaits_user("svc").await);
        assert!(!registry.awaits_user("other").await);
    }

    #[tokio::test]
    async fn test_remove_publishes_event() {
        let registry = ServerRegistry::new();
        registry.begin_attempt("b", None).await;
        registry.begin_attempt("a", None).await;
        assert_eq!(registry.names().await, vec!["a", "b"]);

        let mut events = registry.subscribe();
        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed {
                name: "a".to_string()
            }
        );
        assert_eq!(registry.states().await.len(), 1);
    }
}
