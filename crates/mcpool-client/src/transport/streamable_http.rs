//! Streaming HTTP transport with opaque session resumption.
//!
//! Every outbound frame is an HTTP POST against the server url; response
//! bodies arrive either as plain JSON or as a chunked event stream. During
//! the initialization exchange the server may assign an opaque session id
//! via the `Mcp-Session-Id` header; subsequent requests echo it. A session
//! id held from a previous connection is supplied up front so the server may
//! resume - the server decides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use mcpool_core::{McpError, ServerConfig};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{request_headers, SessionTermination, Transport, TransportEvent};

/// Header carrying the opaque session id, both directions.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

pub struct StreamableHttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    session_id: Arc<parking_lot::RwLock<Option<String>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    open: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(
        server: &str,
        config: &ServerConfig,
        bearer: Option<String>,
        prior_session: Option<&str>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, McpError> {
        let url = config.url.clone().ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "streamable-http transport requires a url".to_string(),
        })?;

        let headers = request_headers(&config.headers, bearer.as_deref()).map_err(|reason| {
            McpError::Configuration {
                server: server.to_string(),
                reason,
            }
        })?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::transport(server, format!("failed to build client: {e}")))?;

        Ok(Self {
            server: server.to_string(),
            url,
            client,
            session_id: Arc::new(parking_lot::RwLock::new(
                prior_session.map(str::to_string),
            )),
            events,
            open: AtomicBool::new(false),
        })
    }

    fn session_termination_url(&self) -> String {
        format!("{}/session", self.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn open(&self) -> Result<(), McpError> {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Opened);
        }
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(McpError::transport(&self.server, "transport not open"));
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let server = self.server.clone();
        let session_id = self.session_id.clone();
        let events = self.events.clone();

        // Fire-and-forget: failures surface as lifecycle events, which is
        // where the session classifier reads them.
        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .header("Accept", "application/json, text/event-stream")
                .json(&frame);
            if let Some(sid) = session_id.read().clone() {
                request = request.header(SESSION_ID_HEADER, sid);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(format!("request failed: {e}")));
                    return;
                }
            };

            if let Some(assigned) = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                let mut current = session_id.write();
                if current.as_deref() != Some(assigned) {
                    debug!(server = %server, session = %assigned, "session id assigned");
                    *current = Some(assigned.to_string());
                }
            }

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let _ = events.send(TransportEvent::Error(format!(
                    "HTTP {} {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or(""),
                    body.chars().take(200).collect::<String>()
                )));
                return;
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            if content_type.starts_with("text/event-stream") {
                let mut decoder = SseFrameDecoder::default();
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = events
                                .send(TransportEvent::Error(format!("stream failed: {e}")));
                            return;
                        }
                    };
                    for payload in decoder.push(&String::from_utf8_lossy(&chunk)) {
                        match serde_json::from_str::<Value>(&payload) {
                            Ok(frame) => {
                                let _ = events.send(TransportEvent::Message(frame));
                            }
                            Err(e) => {
                                debug!(server = %server, error = %e, "unparseable stream payload")
                            }
                        }
                    }
                }
            } else if content_type.starts_with("application/json") {
                match response.json::<Value>().await {
                    Ok(Value::Array(frames)) => {
                        for frame in frames {
                            let _ = events.send(TransportEvent::Message(frame));
                        }
                    }
                    Ok(Value::Null) => {}
                    Ok(frame) => {
                        let _ = events.send(TransportEvent::Message(frame));
                    }
                    Err(e) => {
                        let _ = events
                            .send(TransportEvent::Error(format!("bad response body: {e}")));
                    }
                }
            }
            // 202-style empty bodies (notification acknowledgements) are fine.
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    async fn terminate_session(&self) -> Result<SessionTermination, McpError> {
        let Some(sid) = self.session_id.read().clone() else {
            return Ok(SessionTermination::Unsupported);
        };

        let url = self.session_termination_url();
        info!(server = %self.server, session = %sid, url = %url, "terminating session");

        let response = self
            .client
            .delete(&url)
            .header(SESSION_ID_HEADER, &sid)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => Ok(SessionTermination::Terminated),
            Ok(r) if r.status().as_u16() == 405 => {
                debug!(server = %self.server, "server does not support explicit session termination");
                Ok(SessionTermination::Unsupported)
            }
            Ok(r) => {
                let reason = format!("HTTP {}", r.status().as_u16());
                warn!(server = %self.server, %reason, "session termination refused; session will expire");
                Ok(SessionTermination::SoftFailure(reason))
            }
            Err(e) => {
                warn!(server = %self.server, error = %e, "session termination request failed; session will expire");
                Ok(SessionTermination::SoftFailure(e.to_string()))
            }
        }
    }
}

/// Incremental parser for chunked `text/event-stream` bodies. Yields the
/// joined `data:` payload of each complete event.
#[derive(Default)]
struct SseFrameDecoder {
    buffer: String,
    data: Vec<String>,
}

impl SseFrameDecoder {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut complete = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    complete.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                self.data.push(payload.trim_start().to_string());
            }
            // event:/id:/retry: fields are irrelevant to frame routing.
        }
        complete
    }
}
