//! Correlated JSON-RPC client over a transport's frame channel.
//!
//! Requests are matched to responses by id through a pending map of oneshot
//! senders; server-initiated requests and notifications are handed back to
//! the connection for routing. The client does not own the inbound loop -
//! the connection's router feeds frames in via [`RpcClient::dispatch`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mcpool_core::McpError;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Protocol revision sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Minimum spacing between empty-result replies to server pings. A reply
/// inside this window fails with "Empty result" so idle pings cannot pin
/// the connection alive.
const EMPTY_REPLY_WINDOW: Duration = Duration::from_secs(300);

/// Failure of a single JSON-RPC exchange, before server/context mapping.
#[derive(Debug)]
pub enum RpcFailure {
    /// No response within the deadline.
    Timeout(Duration),
    /// The server answered with a JSON-RPC error object.
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The transport refused the frame or the channel died mid-flight.
    Channel(String),
}

impl RpcFailure {
    /// Render the failure the way the session/authorization classifiers
    /// expect to see it (message text plus embedded code).
    pub fn render(&self) -> String {
        match self {
            Self::Timeout(d) => format!("request timed out after {d:?}"),
            Self::Rpc { code, message, .. } => format!("{message} (code {code})"),
            Self::Channel(msg) => msg.clone(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Inbound frame that is not a response to one of our requests.
#[derive(Debug)]
pub enum Inbound {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// One JSON-RPC client bound to one transport.
pub struct RpcClient {
    server: String,
    transport: Arc<dyn Transport>,
    pending: DashMap<u64, oneshot::Sender<Result<Value, RpcFailure>>>,
    next_id: AtomicU64,
    last_empty_reply: parking_lot::Mutex<Option<Instant>>,
}

impl RpcClient {
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            server: server.into(),
            transport,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            last_empty_reply: parking_lot::Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Issue a request and await the correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let mut frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            frame["params"] = params;
        }

        debug!(server = %self.server, method, id, "sending request");
        if let Err(e) = self.transport.send(frame).await {
            self.pending.remove(&id);
            return Err(RpcFailure::Channel(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcFailure::Channel(
                "response channel closed before reply".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(RpcFailure::Timeout(timeout))
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcFailure> {
        let mut frame = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            frame["params"] = params;
        }
        self.transport
            .send(frame)
            .await
            .map_err(|e| RpcFailure::Channel(e.to_string()))
    }

    /// Answer a server request with an empty result, subject to the
    /// empty-reply guard.
    pub async fn reply_empty(&self, id: Value) -> Result<(), McpError> {
        {
            let mut last = self.last_empty_reply.lock();
            if let Some(at) = *last {
                if at.elapsed() < EMPTY_REPLY_WINDOW {
                    return Err(McpError::transport(&self.server, "Empty result"));
                }
            }
            *last = Some(Instant::now());
        }

        self.transport
            .send(json!({"jsonrpc": "2.0", "id": id, "result": {}}))
            .await
            .map_err(|e| McpError::transport(&self.server, e.to_string()))
    }

    /// Answer a server request with a method-not-found error.
    pub async fn reply_method_not_found(&self, id: Value, method: &str) {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("method not found: {method}")},
        });
        if let Err(e) = self.transport.send(frame).await {
            debug!(server = %self.server, error = %e, "failed to send method-not-found reply");
        }
    }

    /// Route one inbound frame. Responses are delivered to their waiters;
    /// anything else is returned for the connection to handle.
    pub fn dispatch(&self, frame: Value) -> Option<Inbound> {
        let has_method = frame.get("method").is_some();
        let id = frame.get("id").cloned();

        if !has_method {
            // A response: correlate by numeric id.
            let Some(id) = id.as_ref().and_then(Value::as_u64) else {
                warn!(server = %self.server, "dropping response with non-numeric id");
                return None;
            };
            let Some((_, tx)) = self.pending.remove(&id) else {
                debug!(server = %self.server, id, "response for unknown request id");
                return None;
            };

            let outcome = if let Some(error) = frame.get("error") {
                Err(RpcFailure::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                    data: error.get("data").cloned(),
                })
            } else {
                Ok(frame.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
            return None;
        }

        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let params = frame.get("params").cloned();
        match id {
            Some(id) => Some(Inbound::Request { id, method, params }),
            None => Some(Inbound::Notification { method, params }),
        }
    }

    /// Fail every in-flight request, e.g. when the transport dies.
    pub fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RpcFailure::Channel(reason.to_string())));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::transport::testing::ChannelTransport;

    use super::*;

    fn make_client() -> (Arc<RpcClient>, mpsc::UnboundedReceiver<Value>) {
        let (transport, sent_rx) = ChannelTransport::new();
        let client = Arc::new(RpcClient::new("test", Arc::new(transport)));
        (client, sent_rx)
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (client, mut sent) = make_client();

        let fut = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("tools/list", None, Duration::from_secs(1))
                    .await
            })
        };

        let frame = sent.recv().await.unwrap();
        assert_eq!(frame["method"], "tools/list");
        let id = frame["id"].as_u64().unwrap();

        client.dispatch(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}}));

        let result = fut.await.unwrap().unwrap();
        assert_eq!(result["tools"], json!([]));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_surfaces_code() {
        let (client, mut sent) = make_client();

        let fut = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("tools/call", None, Duration::from_secs(1))
                    .await
            })
        };

        let id = sent.recv().await.unwrap()["id"].as_u64().unwrap();
        client.dispatch(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": 401, "message": "Unauthorized"},
        }));

        let failure = fut.await.unwrap().unwrap_err();
        assert_eq!(failure.code(), Some(401));
        assert!(failure.render().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending() {
        let (client, _sent) = make_client();
        let failure = client
            .request("ping", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(failure, RpcFailure::Timeout(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_classifies_inbound() {
        let (client, _sent) = make_client();

        let req = client
            .dispatch(json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
            .unwrap();
        assert!(matches!(req, Inbound::Request { ref method, .. } if method == "ping"));

        let note = client
            .dispatch(json!({
                "jsonrpc": "2.0",
                "method": "notifications/resources/list_changed",
            }))
            .unwrap();
        assert!(
            matches!(note, Inbound::Notification { ref method, .. }
                if method == "notifications/resources/list_changed")
        );
    }

    #[tokio::test]
    async fn test_empty_reply_guard() {
        let (client, mut sent) = make_client();

        client.reply_empty(json!(1)).await.unwrap();
        let frame = sent.recv().await.unwrap();
        assert_eq!(frame["result"], json!({}));

        // Second reply inside the five minute window is refused.
        let err = client.reply_empty(json!(2)).await.unwrap_err();
        assert!(err.to_string().contains("Empty result"));
    }

    #[tokio::test]
    async fn test_fail_all_pending() {
        let (client, mut sent) = make_client();

        let fut = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("tools/list", None, Duration::from_secs(5))
                    .await
            })
        };
        sent.recv().await.unwrap();

        client.fail_all_pending("transport closed");
        let failure = fut.await.unwrap().unwrap_err();
        assert!(failure.render().contains("transport closed"));
    }
}
