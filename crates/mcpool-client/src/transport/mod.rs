//! Transport adapters for MCP connections.
//!
//! Each adapter yields a bidirectional JSON-RPC frame channel with a uniform
//! contract: `open()` (idempotent), `send(frame)` (fire-and-forget),
//! `close()` (graceful), and lifecycle events `{Opened, Message, Closed,
//! Error}` delivered on the channel handed to the factory. The connection's
//! router consumes the events and drives the state machine.

mod sse;
mod stdio;
mod streamable_http;
mod websocket;

pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcpool_core::{AuthTokens, McpError, ServerConfig, TransportKind};
use serde_json::Value;
use tokio::sync::mpsc;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use websocket::WebsocketTransport;

/// Lifecycle events every adapter reports.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Message(Value),
    Closed,
    Error(String),
}

/// Outcome of an explicit end-of-session request (streaming-HTTP only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTermination {
    /// Server acknowledged with 2xx.
    Terminated,
    /// Server answered 405 or the transport has no session protocol.
    Unsupported,
    /// Any other response; the session will expire server-side.
    SoftFailure(String),
}

/// Uniform adapter contract. Implementations serialize their own internal
/// state; all methods take `&self`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the stream. Idempotent.
    async fn open(&self) -> Result<(), McpError>;

    /// Queue one JSON-RPC frame for delivery.
    async fn send(&self, frame: Value) -> Result<(), McpError>;

    /// Graceful close. Safe to call repeatedly.
    async fn close(&self) -> Result<(), McpError>;

    /// Remote-issued session id, when the transport carries one.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Send the explicit end-of-session request, when the transport
    /// supports one.
    async fn terminate_session(&self) -> Result<SessionTermination, McpError> {
        Ok(SessionTermination::Unsupported)
    }
}

/// Everything an adapter needs at construction time.
pub struct TransportContext<'a> {
    pub server: &'a str,
    pub config: &'a ServerConfig,
    pub auth: Option<&'a AuthTokens>,
    /// Prior streaming-HTTP session id, supplied up front so the server may
    /// resume.
    pub session_id: Option<&'a str>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// Factory selecting and constructing the adapter for a descriptor.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ctx: TransportContext<'_>) -> Result<Arc<dyn Transport>, McpError>;
}

/// Production factory applying the selection rule from the descriptor.
#[derive(Default)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(&self, ctx: TransportContext<'_>) -> Result<Arc<dyn Transport>, McpError> {
        let kind = ctx.config.transport_kind(ctx.server)?;
        match kind {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::new(
                ctx.server,
                ctx.config,
                ctx.events,
            )?)),
            TransportKind::Sse => Ok(Arc::new(SseTransport::new(
                ctx.server,
                ctx.config,
                bearer_token(ctx.auth),
                ctx.events,
            )?)),
            TransportKind::Websocket => Ok(Arc::new(WebsocketTransport::new(
                ctx.server,
                ctx.config,
                ctx.events,
            )?)),
            TransportKind::StreamableHttp => Ok(Arc::new(StreamableHttpTransport::new(
                ctx.server,
                ctx.config,
                bearer_token(ctx.auth),
                ctx.session_id,
                ctx.events,
            )?)),
        }
    }
}

fn bearer_token(auth: Option<&AuthTokens>) -> Option<String> {
    auth.map(|t| t.access_token.clone())
}

/// Merge configured headers with the bearer token, if any.
pub(crate) fn request_headers(
    configured: &HashMap<String, String>,
    bearer: Option<&str>,
) -> Result<reqwest::header::HeaderMap, String> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

    let mut map = HeaderMap::new();
    for (key, value) in configured {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("invalid header name '{key}': {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid header value for '{key}': {e}"))?;
        map.insert(name, value);
    }
    if let Some(token) = bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| format!("invalid bearer token: {e}"))?;
        map.insert(AUTHORIZATION, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_merges_bearer() {
        let configured = HashMap::from([("X-Region".to_string(), "eu".to_string())]);
        let headers = request_headers(&configured, Some("tok")).unwrap();
        assert_eq!(headers.get("x-region").unwrap(), "eu");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
    }

    #[test]
    fn test_request_headers_rejects_bad_names() {
        let configured = HashMap::from([("bad header\n".to_string(), "v".to_string())]);
        assert!(request_headers(&configured, None).is_err());
    }

    #[tokio::test]
    async fn test_factory_selects_by_descriptor() {
        let factory = DefaultTransportFactory;
        let (tx, _rx) = mpsc::unbounded_channel();

        let stdio: ServerConfig = serde_json::from_str(r#"{"command": "./calc"}"#).unwrap();
        let ctx = TransportContext {
            server: "calc",
            config: &stdio,
            auth: None,
            session_id: None,
            events: tx.clone(),
        };
        let transport = factory.create(ctx).await.unwrap();
        assert!(transport.session_id().is_none());

        let bad: ServerConfig = serde_json::from_str(r#"{"type": "sse"}"#).unwrap();
        let ctx = TransportContext {
            server: "bad",
            config: &bad,
            auth: None,
            session_id: None,
            events: tx,
        };
        assert!(factory.create(ctx).await.is_err());
    }
}
