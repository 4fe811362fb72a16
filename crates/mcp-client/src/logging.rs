use mcp_types::{LogLevel, ServerLogEvent};
use std::sync::Arc;

/// Receiver for server-scoped log events.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: ServerLogEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _event: ServerLogEvent) {}
}

/// Emits log events tagged with one server's name.
#[derive(Clone)]
pub struct ServerLogger {
    server: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl ServerLogger {
    pub fn new(server: &str, sink: Arc<dyn LogSink>) -> Self {
        Self {
            server: Arc::from(server),
            sink,
        }
    }

    pub fn detached(server: &str) -> Self {
        Self::new(server, Arc::new(NullSink))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink
            .emit(ServerLogEvent::new(self.server.as_ref(), level, message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl std::fmt::Debug for ServerLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLogger")
            .field("server", &self.server)
            .finish()
    }
}
