use crate::logging::ServerLogger;
use rmcp::service::{RoleClient, RxJsonRpcMessage, TxJsonRpcMessage};
use rmcp::transport::Transport;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;

/// Wraps a client transport and reports every frame, the close and any send
/// error as server-scoped log events.
pub struct LoggedTransport<T> {
    inner: T,
    logger: ServerLogger,
}

impl<T> LoggedTransport<T> {
    pub fn new(inner: T, logger: ServerLogger) -> Self {
        Self { inner, logger }
    }
}

fn log_frame<M: Serialize>(logger: &ServerLogger, direction: &str, message: &M) {
    match serde_json::to_value(message) {
        Ok(frame) if is_heartbeat(&frame) => {}
        Ok(frame) => logger.debug(format!("{} {}", direction, frame)),
        Err(e) => logger.warn(format!("{} unserializable frame: {}", direction, e)),
    }
}

/// Empty keep-alive responses are not worth a log line each.
fn is_heartbeat(frame: &Value) -> bool {
    frame
        .get("result")
        .and_then(Value::as_object)
        .is_some_and(|result| result.is_empty())
}

impl<T> Transport<RoleClient> for LoggedTransport<T>
where
    T: Transport<RoleClient>,
{
    type Error = T::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        log_frame(&self.logger, "-->", &item);
        let logger = self.logger.clone();
        let sending = self.inner.send(item);
        async move {
            let result = sending.await;
            if let Err(e) = &result {
                logger.error(format!("Transport error: {}", e));
            }
            result
        }
    }

    fn receive(&mut self) -> impl Future<Output = Option<RxJsonRpcMessage<RoleClient>>> + Send {
        let logger = self.logger.clone();
        let receiving = self.inner.receive();
        async move {
            let message = receiving.await;
            match &message {
                Some(message) => log_frame(&logger, "<--", message),
                None => logger.info("Transport closed"),
            }
            message
        }
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let logger = self.logger.clone();
        let closing = self.inner.close();
        async move {
            let result = closing.await;
            match &result {
                Ok(()) => logger.info("Transport closed"),
                Err(e) => logger.error(format!("Transport error on close: {}", e)),
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_heartbeat_detection() {
        assert!(is_heartbeat(&json!({"jsonrpc": "2.0", "id": 3, "result": {}})));
        assert!(!is_heartbeat(&json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}})));
        assert!(!is_heartbeat(&json!({"jsonrpc": "2.0", "method": "ping", "id": 4})));
    }

    #[test]
    fn test_nested_empty_result_is_logged() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {"content": [{"type": "text", "text": "ok"}], "meta": {"result": {}}}
        });
        assert!(!is_heartbeat(&frame));

        let frame = json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"result": {}}
        });
        assert!(!is_heartbeat(&frame));
    }
}
