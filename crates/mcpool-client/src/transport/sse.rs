//! Server-sent-events transport.
//!
//! Inbound frames arrive on a long-lived SSE stream; the server's `endpoint`
//! event names the POST target for outbound frames. Requests carry the
//! configured headers plus a bearer token when authorization is available.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcpool_core::{McpError, ServerConfig};
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::{request_headers, Transport, TransportEvent};

/// How long `send` waits for the server to announce its message endpoint.
const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

pub struct SseTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    events: mpsc::UnboundedSender<TransportEvent>,
    message_url_tx: watch::Sender<Option<String>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(
        server: &str,
        config: &ServerConfig,
        bearer: Option<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, McpError> {
        let url = config.url.clone().ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "sse transport requires a url".to_string(),
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

        let (message_url_tx, _) = watch::channel(None);
        Ok(Self {
            server: server.to_string(),
            url,
            client,
            events,
            message_url_tx,
            listener: Mutex::new(None),
        })
    }

    /// Fallback POST target when the server never announces one.
    fn derived_endpoint(&self) -> String {
        format!(
            "{}/messages",
            self.url.trim_end_matches("/sse").trim_end_matches('/')
        )
    }

    async fn message_url(&self) -> String {
        let mut rx = self.message_url_tx.subscribe();
        let wait = tokio::time::timeout(ENDPOINT_WAIT, async {
            loop {
                let current = rx.borrow().clone();
                if let Some(url) = current {
                    return url;
                }
                if rx.changed().await.is_err() {
                    return String::new();
                }
            }
        })
        .await;

        match wait {
            Ok(url) if !url.is_empty() => url,
            _ => {
                let fallback = self.derived_endpoint();
                debug!(server = %self.server, url = %fallback, "no endpoint event, using derived message url");
                fallback
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&self) -> Result<(), McpError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        info!(server = %self.server, url = %self.url, "opening sse stream");
        let mut source = EventSource::new(self.client.get(&self.url))
            .map_err(|e| McpError::transport(&self.server, format!("sse connect failed: {e}")))?;

        let events = self.events.clone();
        let server = self.server.clone();
        let message_url_tx = self.message_url_tx.clone();
        let base_url = self.url.clone();

        *listener = Some(tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {
                        debug!(server = %server, "sse stream open");
                        let _ = events.send(TransportEvent::Opened);
                    }
                    Ok(Event::Message(message)) => {
                        if message.event == "endpoint" {
                            if let Some(endpoint) = resolve_endpoint(&base_url, &message.data) {
                                debug!(server = %server, endpoint = %endpoint, "message endpoint announced");
                                let _ = message_url_tx.send(Some(endpoint));
                            }
                            continue;
                        }
                        match serde_json::from_str::<Value>(&message.data) {
                            Ok(frame) => {
                                let _ = events.send(TransportEvent::Message(frame));
                            }
                            Err(e) => {
                                debug!(server = %server, error = %e, "unparseable sse payload")
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server = %server, error = %e, "sse stream error");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed);
        }));

        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        let target = self.message_url().await;
        let response = self
            .client
            .post(&target)
            .json(&frame)
            .send()
            .await
            .map_err(|e| McpError::transport(&self.server, format!("post failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::transport(
                &self.server,
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                ),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
            let _ = self.events.send(TransportEvent::Closed);
        }
        let _ = self.message_url_tx.send(None);
        Ok(())
    }
}

/// Resolve an announced endpoint (relative or absolute) against the stream
/// url.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> Option<String> {
    url::Url::parse(base_url)
        .ok()
        .and_then(|base| base.join(endpoint).ok())
        .map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> SseTransport {
        let config: ServerConfig =
            serde_json::from_str(&format!(r#"{{"type": "sse", "url": "{url}"}}"#)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        SseTransport::new("s", &config, None, tx).unwrap()
    }

    #[test]
    fn test_derived_endpoint_strips_sse_suffix() {
        let t = transport("https://example.com/sse");
        assert_eq!(t.derived_endpoint(), "https://example.com/messages");

        let t = transport("https://example.com/api/");
        assert_eq!(t.derived_endpoint(), "https://example.com/api/messages");
    }

    #[test]
    fn test_resolve_endpoint_relative_and_absolute() {
        assert_eq!(
            resolve_endpoint("https://example.com/sse", "/messages?sessionId=x").unwrap(),
            "https://example.com/messages?sessionId=x"
        );
        assert_eq!(
            resolve_endpoint("https://example.com/sse", "https://other.example.com/m").unwrap(),
            "https://other.example.com/m"
        );
    }

    #[tokio::test]
    async fn test_message_url_falls_back_after_wait() {
        let t = transport("https://example.com/sse");
        // Nothing announced: falls back to the derived endpoint. Announce
        // first so the test does not sit through the five second wait.
        t.message_url_tx
            .send(Some("https://example.com/custom".to_string()))
            .unwrap();
        assert_eq!(t.message_url().await, "https://example.com/custom");
    }
}
