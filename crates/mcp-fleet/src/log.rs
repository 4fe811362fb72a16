use mcp_client::LogSink;
use mcp_types::{LogLevel, ServerLogEvent};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Fans server-scoped log events out to subscribers and mirrors them into
/// `tracing`. Sending never blocks; slow subscribers lose old events.
#[derive(Debug, Clone)]
pub struct BroadcastLogSink {
    tx: broadcast::Sender<ServerLogEvent>,
}

impl Default for BroadcastLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastLogSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerLogEvent> {
        self.tx.subscribe()
    }
}

impl LogSink for BroadcastLogSink {
    fn emit(&self, event: ServerLogEvent) {
        let server = event.server_name.as_str();
        match event.level {
            LogLevel::Debug => debug!(server = %server, "{}", event.message),
            LogLevel::Info => info!(server = %server, "{}", event.message),
            LogLevel::Warn => warn!(server = %server, "{}", event.message),
            LogLevel::Error => error!(server = %server, "{}", event.message),
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
