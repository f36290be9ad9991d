//! In-process transports for exercising connections and the pool without
//! real servers. Mirrors the mock-repository style used across the unit
//! tests: scripted state, counters for assertions, no network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::McpError;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{SessionTermination, Transport, TransportContext, TransportEvent, TransportFactory};
use crate::rpc::MCP_PROTOCOL_VERSION;

/// Transport that records sent frames on a channel and emits nothing.
/// Suitable for driving `RpcClient` directly.
pub struct ChannelTransport {
    sent: mpsc::UnboundedSender<Value>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (Self { sent }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        self.sent
            .send(frame)
            .map_err(|_| McpError::transport("channel", "receiver dropped"))
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

/// Custom reply for a tool call: (tool name, arguments) -> result value.
pub type CallHandler = Arc<dyn Fn(&str, Option<&Value>) -> Result<Value, (i64, String)> + Send + Sync>;

/// Scripted in-process MCP server doubling as a [`TransportFactory`].
///
/// Each `create` yields a fresh transport wired to the same script:
/// session ids are popped per connect, a bearer requirement gates the
/// handshake with a 401, counters record connects and session terminations.
#[derive(Clone, Default)]
pub struct MockServer {
    inner: Arc<MockServerInner>,
}

#[derive(Default)]
struct MockServerInner {
    tools: parking_lot::RwLock<Vec<Value>>,
    instructions: parking_lot::RwLock<Option<String>>,
    session_ids: parking_lot::Mutex<VecDeque<String>>,
    require_bearer: parking_lot::RwLock<Option<String>>,
    call_handler: parking_lot::RwLock<Option<CallHandler>>,
    reply_latency: parking_lot::RwLock<Option<Duration>>,
    connects: AtomicUsize,
    terminations: AtomicUsize,
    fail_handshakes: AtomicUsize,
    active_events: parking_lot::Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default().with_tools(vec![json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {"type": "object", "properties": {"a": {}, "b": {}}},
        })])
    }

    pub fn with_tools(self, tools: Vec<Value>) -> Self {
        *self.inner.tools.write() = tools;
        self
    }

    pub fn with_instructions(self, instructions: &str) -> Self {
        *self.inner.instructions.write() = Some(instructions.to_string());
        self
    }

    /// Queue a session id to assign on the next handshake.
    pub fn push_session_id(&self, id: &str) {
        self.inner.session_ids.lock().push_back(id.to_string());
    }

    /// Reject handshakes with a 401 unless the connect carries this bearer.
    pub fn require_bearer(&self, token: &str) {
        *self.inner.require_bearer.write() = Some(token.to_string());
    }

    pub fn set_call_handler(&self, handler: CallHandler) {
        *self.inner.call_handler.write() = Some(handler);
    }

    pub fn set_reply_latency(&self, latency: Duration) {
        *self.inner.reply_latency.write() = Some(latency);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.inner.terminations.load(Ordering::SeqCst)
    }

    /// Fail the next `n` handshakes with a connection error.
    pub fn fail_handshakes(&self, n: usize) {
        self.inner.fail_handshakes.store(n, Ordering::SeqCst);
    }

    /// Push a transport error into the most recent live connection, e.g.
    /// `"HTTP 404 Not Found: session not found"`.
    pub fn inject_error(&self, message: &str) {
        if let Some(events) = self.inner.active_events.lock().last() {
            let _ = events.send(TransportEvent::Error(message.to_string()));
        }
    }

    /// Drop the connection from the server side.
    pub fn inject_close(&self) {
        if let Some(events) = self.inner.active_events.lock().last() {
            let _ = events.send(TransportEvent::Closed);
        }
    }
}

#[async_trait]
impl TransportFactory for MockServer {
    async fn create(&self, ctx: TransportContext<'_>) -> Result<Arc<dyn Transport>, McpError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner
            .active_events
            .lock()
            .push(ctx.events.clone());

        let session = self.inner.session_ids.lock().pop_front();
        Ok(Arc::new(MockTransport {
            inner: self.inner.clone(),
            bearer: ctx.auth.map(|t| t.access_token.clone()),
            session: parking_lot::RwLock::new(session),
            terminated: parking_lot::RwLock::new(false),
            events: ctx.events,
        }))
    }
}

pub struct MockTransport {
    inner: Arc<MockServerInner>,
    bearer: Option<String>,
    session: parking_lot::RwLock<Option<String>>,
    terminated: parking_lot::RwLock<bool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    fn respond(&self, id: Value, method: &str, params: Option<&Value>) -> Value {
        if method == "initialize" {
            let remaining = self.inner.fail_handshakes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.inner
                    .fail_handshakes
                    .store(remaining - 1, Ordering::SeqCst);
                return json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "connection refused"},
                });
            }
        }

        if let Some(expected) = self.inner.require_bearer.read().clone() {
            if self.bearer.as_deref() != Some(expected.as_str()) {
                return json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": 401, "message": "401 Unauthorized"},
                });
            }
        }

        let result = match method {
            "initialize" => {
                let mut result = json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "0.0.0"},
                });
                if let Some(instructions) = self.inner.instructions.read().clone() {
                    result["instructions"] = json!(instructions);
                }
                Ok(result)
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.inner.tools.read().clone()})),
            "resources/list" => Ok(json!({"resources": []})),
            "prompts/list" => Ok(json!({"prompts": []})),
            "tools/call" => {
                let name = params
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params.and_then(|p| p.get("arguments")).cloned();
                let handler = self.inner.call_handler.read().clone();
                match handler {
                    Some(handler) => handler(&name, arguments.as_ref()),
                    None => Ok(json!({
                        "content": [{"type": "text", "text": "ok"}],
                        "isError": false,
                    })),
                }
            }
            other => Err((-32601, format!("method not found: {other}"))),
        };

        match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<(), McpError> {
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        let (Some(method), Some(id)) = (
            frame.get("method").and_then(Value::as_str).map(String::from),
            frame.get("id").cloned(),
        ) else {
            return Ok(()); // notifications and replies need no answer
        };

        let response = self.respond(id, &method, frame.get("params"));
        let events = self.events.clone();
        let latency = *self.inner.reply_latency.read();
        tokio::spawn(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            let _ = events.send(TransportEvent::Message(response));
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        let _ = self.events.send(TransportEvent::Closed);
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    async fn terminate_session(&self) -> Result<SessionTermination, McpError> {
        if self.session.read().is_none() {
            return Ok(SessionTermination::Unsupported);
        }
        *self.terminated.write() = true;
        self.inner.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(SessionTermination::Terminated)
    }
}
