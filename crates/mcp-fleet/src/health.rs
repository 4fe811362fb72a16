//! Per-server liveness supervision.
//!
//! The scheduler owns one cancellable task per supervised server. A task
//! pings running servers on a fixed interval, demotes them to `error` on the
//! first failed ping and then performs exactly one delayed reconnection per
//! failure. Servers already in `error` skip the ping and go straight to the
//! delayed reconnection. A `stopped` or removed server ends its task, as
//! does one whose last attempt is waiting on the user.

use async_trait::async_trait;
use mcp_client::ConnectionError;
use mcp_types::ConnectionStatus;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub reconnect_delay: Duration,
}

/// What a health task needs from the component that owns the connections.
#[async_trait]
pub trait HealthTarget: Send + Sync {
    async fn status(&self, server: &str) -> Option<ConnectionStatus>;

    async fn ping(&self, server: &str) -> Result<(), ConnectionError>;

    async fn mark_healthy(&self, server: &str);

    async fn mark_unhealthy(&self, server: &str, error: &ConnectionError);

    /// True when the last failure needs user action before another attempt,
    /// such as an abandoned browser authorization.
    async fn awaits_user(&self, _server: &str) -> bool {
        false
    }

    /// Forced reconnection from the latest configuration.
    async fn reconnect(&self, server: &str);
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthScheduler {
    policy: HealthPolicy,
    monitors: Mutex<HashMap<String, Monitor>>,
}

impl HealthScheduler {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start supervising `server` unless a live task already does.
    pub fn ensure(&self, server: &str, target: Weak<dyn HealthTarget>) {
        let Ok(mut monitors) = self.monitors.lock() else {
            return;
        };

        if let Some(existing) = monitors.get(server) {
            if !existing.handle.is_finished() && !existing.cancel.is_cancelled() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            server.to_string(),
            target,
            self.policy,
            cancel.clone(),
        ));
        debug!(server = %server, "Health monitor started");
        monitors.insert(server.to_string(), Monitor { cancel, handle });
    }

    #[cfg(test)]
    pub(crate) fn is_monitoring(&self, server: &str) -> bool {
        self.monitors
            .lock()
            .map(|monitors| {
                monitors
                    .get(server)
                    .is_some_and(|m| !m.handle.is_finished() && !m.cancel.is_cancelled())
            })
            .unwrap_or(false)
    }

    /// Cancel the server's task and wait for it to end. Once this returns no
    /// further pings or reconnects happen for `server`.
    pub async fn stop(&self, server: &str) {
        let monitor = self
            .monitors
            .lock()
            .ok()
            .and_then(|mut monitors| monitors.remove(server));

        if let Some(monitor) = monitor {
            finish(monitor).await;
            debug!(server = %server, "Health monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let monitors: Vec<Monitor> = self
            .monitors
            .lock()
            .map(|mut monitors| monitors.drain().map(|(_, m)| m).collect())
            .unwrap_or_default();

        for monitor in monitors {
            finish(monitor).await;
        }
    }
}

impl Drop for HealthScheduler {
    fn drop(&mut self) {
        if let Ok(monitors) = self.monitors.get_mut() {
            for monitor in monitors.values() {
                monitor.cancel.cancel();
                monitor.handle.abort();
            }
        }
    }
}

async fn finish(monitor: Monitor) {
    monitor.cancel.cancel();
    monitor.handle.abort();
    let _ = monitor.handle.await;
}

async fn supervise(
    server: String,
    target: Weak<dyn HealthTarget>,
    policy: HealthPolicy,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        match target.status(&server).await {
            None | Some(ConnectionStatus::Stopped) => {
                debug!(server = %server, "Server no longer supervised");
                break;
            }
            Some(ConnectionStatus::Starting) => continue,
            Some(ConnectionStatus::Running) => match target.ping(&server).await {
                Ok(()) => target.mark_healthy(&server).await,
                Err(e) => {
                    warn!(server = %server, "Health check failed: {}", e);
                    target.mark_unhealthy(&server, &e).await;
                    if !reconnect_after_delay(&server, target.as_ref(), &policy, &cancel).await {
                        break;
                    }
                }
            },
            Some(ConnectionStatus::Error) => {
                if target.awaits_user(&server).await {
                    info!(server = %server, "Waiting for the user before reconnecting");
                    break;
                }
                if !reconnect_after_delay(&server, target.as_ref(), &policy, &cancel).await {
                    break;
                }
            }
        }
    }
}

/// Returns `false` if cancelled while waiting.
async fn reconnect_after_delay(
    server: &str,
    target: &dyn HealthTarget,
    policy: &HealthPolicy,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = sleep(policy.reconnect_delay) => {}
    }

    // Stopped or parked for the user while we waited
    if matches!(
        target.status(server).await,
        None | Some(ConnectionStatus::Stopped)
    ) || target.awaits_user(server).await
    {
        return false;
    }

    info!(server = %server, "Attempting reconnection");
    target.reconnect(server).await;
    true
}
