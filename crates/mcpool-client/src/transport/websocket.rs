//! Full-duplex socket transport over `ws://` / `wss://`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mcpool_core::{McpError, ServerConfig};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent};

enum Outbound {
    Frame(String),
    Shutdown,
}

#[derive(Debug)]
pub struct WebsocketTransport {
    server: String,
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    out_tx: mpsc::UnboundedSender<Outbound>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WebsocketTransport {
    pub fn new(
        server: &str,
        config: &ServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, McpError> {
        let url = config.url.clone().ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "websocket transport requires a url".to_string(),
        })?;
        Ok(Self {
            server: server.to_string(),
            url,
            events,
            state: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn open(&self) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        info!(server = %self.server, url = %self.url, "connecting websocket");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| McpError::transport(&self.server, format!("connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let mut tasks = Vec::new();

        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let result = match outbound {
                    Outbound::Frame(text) => sink.send(Message::Text(text)).await,
                    Outbound::Shutdown => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    let _ = events.send(TransportEvent::Error(format!("ws send failed: {e}")));
                    break;
                }
            }
        }));

        let events = self.events.clone();
        let server = self.server.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(frame) => {
                            let _ = events.send(TransportEvent::Message(frame));
                        }
                        Err(e) => debug!(server = %server, error = %e, "unparseable ws payload"),
                    },
                    Ok(Message::Close(_)) => {
                        debug!(server = %server, "ws closed by server");
                        break;
                    }
                    Ok(_) => {} // ping/pong handled by tungstenite, binary ignored
                    Err(e) => {
                        warn!(server = %server, error = %e, "ws stream error");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed);
        }));

        *state = Some(Running { out_tx, tasks });
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        let state = self.state.lock().await;
        let running = state
            .as_ref()
            .ok_or_else(|| McpError::transport(&self.server, "transport not open"))?;

        let text = serde_json::to_string(&frame)
            .map_err(|e| McpError::transport(&self.server, format!("serialize failed: {e}")))?;
        running
            .out_tx
            .send(Outbound::Frame(text))
            .map_err(|_| McpError::transport(&self.server, "ws writer gone"))
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(running) = self.state.lock().await.take() {
            let _ = running.out_tx.send(Outbound::Shutdown);
            // Give the close frame a moment to flush, then stop the tasks.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            for task in running.tasks {
                task.abort();
            }
        }
        Ok(())
    }
}
