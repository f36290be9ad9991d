//! Connection - one transport + one JSON-RPC client for one server in one
//! scope.
//!
//! Owns the connect/reconnect/recover state machine, performs the
//! capability handshake, executes tool calls with timeouts, and emits
//! lifecycle events. The authorization coordinator communicates by posting
//! `OAuthHandled` / `OAuthFailed` onto this connection's event channel; the
//! connection never hands control of its state machine to callbacks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpool_core::{
    is_authorization_error, AuthTokens, ConnectionEvent, ConnectionState, McpError, ServerConfig,
    ServerInstructions, TransportKind,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::rpc::{Inbound, RpcClient, RpcFailure, MCP_PROTOCOL_VERSION};
use crate::session::{classify_session_error, is_valid_session_id, SessionRecord};
use crate::transport::{
    SessionTermination, TransportContext, TransportEvent, TransportFactory,
};

/// Delay before re-establishing after a recoverable session error.
const SESSION_RECOVERY_DELAY: Duration = Duration::from_millis(1000);

/// Authorization wait when the descriptor does not set `initTimeout`.
const OAUTH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect loop shape: up to `max_attempts` with exponential backoff
/// `min(base * 2^n, cap)`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let millis = (self.base_delay.as_millis() as u64)
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.cap.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Tool descriptor from `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

pub struct Connection {
    server: String,
    principal: String,
    thread_id: Option<String>,
    config: ServerConfig,
    kind: TransportKind,
    factory: Arc<dyn TransportFactory>,
    init_timeout: Duration,
    reconnect_policy: ReconnectPolicy,

    state: parking_lot::RwLock<ConnectionState>,
    reconnect_attempts: AtomicU32,
    reconnecting: AtomicBool,
    initializing: AtomicBool,
    awaiting_oauth: AtomicBool,
    stop_reconnecting: AtomicBool,

    auth_tokens: parking_lot::RwLock<Option<AuthTokens>>,
    session: parking_lot::RwLock<Option<SessionRecord>>,
    capabilities: parking_lot::RwLock<Option<Value>>,
    instructions: parking_lot::RwLock<Option<String>>,
    tools_cache: parking_lot::RwLock<Vec<ToolInfo>>,

    client: parking_lot::RwLock<Option<Arc<RpcClient>>>,
    router: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes connect/disconnect; duplicate connect callers queue here
    /// and observe the completed attempt instead of starting their own.
    connect_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("principal", &self.principal)
            .field("thread_id", &self.thread_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

enum HandshakeError {
    Auth(String),
    Other(McpError),
}

impl Connection {
    pub fn new(
        server: impl Into<String>,
        config: ServerConfig,
        principal: impl Into<String>,
        thread_id: Option<String>,
        factory: Arc<dyn TransportFactory>,
        init_timeout: Option<Duration>,
    ) -> Result<Self, McpError> {
        let server = server.into();
        let kind = config.transport_kind(&server)?;
        let init_timeout = init_timeout.unwrap_or_else(|| config.init_timeout());
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            server,
            principal: principal.into(),
            thread_id,
            config,
            kind,
            factory,
            init_timeout,
            reconnect_policy: ReconnectPolicy::default(),
            state: parking_lot::RwLock::new(ConnectionState::Disconnected),
            reconnect_attempts: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
            awaiting_oauth: AtomicBool::new(false),
            stop_reconnecting: AtomicBool::new(false),
            auth_tokens: parking_lot::RwLock::new(None),
            session: parking_lot::RwLock::new(None),
            capabilities: parking_lot::RwLock::new(None),
            instructions: parking_lot::RwLock::new(None),
            tools_cache: parking_lot::RwLock::new(Vec::new()),
            client: parking_lot::RwLock::new(None),
            router: parking_lot::Mutex::new(None),
            connect_lock: Mutex::new(()),
            events,
        })
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn session_info(&self) -> Option<SessionRecord> {
        self.session.read().clone()
    }

    pub fn reconnect_attempt_count(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn capabilities(&self) -> Option<Value> {
        self.capabilities.read().clone()
    }

    pub fn server_instructions(&self) -> Option<String> {
        self.instructions.read().clone()
    }

    pub fn cached_tools(&self) -> Vec<ToolInfo> {
        self.tools_cache.read().clone()
    }

    /// Inject updated tokens for use on the next transport build.
    pub fn set_auth_tokens(&self, tokens: AuthTokens) {
        *self.auth_tokens.write() = Some(tokens);
    }

    pub fn auth_tokens(&self) -> Option<AuthTokens> {
        self.auth_tokens.read().clone()
    }

    pub(crate) fn notify_oauth_handled(&self) {
        self.emit(ConnectionEvent::OAuthHandled);
    }

    pub(crate) fn notify_oauth_failed(&self, error: impl Into<String>) {
        self.emit(ConnectionEvent::OAuthFailed {
            error: error.into(),
        });
    }

    /// Drive the connection to `connected`. Idempotent when already
    /// connected; concurrent callers serialize on the connect lock and
    /// observe the in-flight attempt's outcome.
    pub async fn connect(self: &Arc<Self>) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected && self.client.read().is_some() {
            return Ok(());
        }

        self.initializing.store(true, Ordering::SeqCst);
        let result = self.establish().await;
        self.initializing.store(false, Ordering::SeqCst);

        if result.is_err() {
            self.set_state(ConnectionState::Error);
        }
        result
    }

    async fn establish(self: &Arc<Self>) -> Result<(), McpError> {
        self.set_state(ConnectionState::Connecting);
        self.teardown_transport("superseded by new connect").await;

        let mut attempted_oauth = false;
        loop {
            match self.handshake().await {
                Ok(()) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!(server = %self.server, principal = %self.principal, "connected");
                    return Ok(());
                }
                Err(HandshakeError::Auth(trigger)) if !attempted_oauth => {
                    attempted_oauth = true;
                    self.await_authorization(trigger).await?;
                    // Authorization round-trip done; resume the original
                    // connect attempt with the fresh tokens.
                    self.set_state(ConnectionState::Connecting);
                }
                Err(HandshakeError::Auth(trigger)) => {
                    return Err(McpError::AuthorizationFailed {
                        server: self.server.clone(),
                        principal: self.principal.clone(),
                        reason: trigger,
                    });
                }
                Err(HandshakeError::Other(e)) => return Err(e),
            }
        }
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), HandshakeError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let prior_session = if self.kind == TransportKind::StreamableHttp {
            self.session
                .read()
                .as_ref()
                .filter(|s| !s.terminated)
                .map(|s| s.id.clone())
        } else {
            None
        };
        let auth = self.auth_tokens.read().clone();

        let transport = self
            .factory
            .create(TransportContext {
                server: &self.server,
                config: &self.config,
                auth: auth.as_ref(),
                session_id: prior_session.as_deref(),
                events: events_tx,
            })
            .await
            .map_err(HandshakeError::Other)?;
        transport.open().await.map_err(HandshakeError::Other)?;

        let client = Arc::new(RpcClient::new(&self.server, transport));
        *self.client.write() = Some(client.clone());
        self.spawn_router(events_rx, client.clone());

        let init_result = client
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "clientInfo": {
                        "name": "mcpool",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {},
                })),
                self.init_timeout,
            )
            .await;

        let result = match init_result {
            Ok(result) => result,
            Err(failure) => {
                let message = failure.render();
                let code = failure.code();
                self.teardown_transport("handshake failed").await;
                return Err(if is_authorization_error(&message, code) {
                    HandshakeError::Auth(message)
                } else if let RpcFailure::Timeout(d) = failure {
                    HandshakeError::Other(McpError::timeout(&self.server, "connect", d))
                } else {
                    HandshakeError::Other(McpError::transport(&self.server, message))
                });
            }
        };

        if let Err(failure) = client.notify("notifications/initialized", None).await {
            let message = failure.render();
            self.teardown_transport("initialized notification failed").await;
            return Err(HandshakeError::Other(McpError::transport(
                &self.server,
                message,
            )));
        }

        *self.capabilities.write() = result.get("capabilities").cloned();
        if self.config.wants_instructions() {
            let text = match &self.config.server_instructions {
                Some(ServerInstructions::Custom(text)) => Some(text.clone()),
                _ => result
                    .get("instructions")
                    .and_then(Value::as_str)
                    .map(String::from),
            };
            *self.instructions.write() = text;
        }

        if self.kind == TransportKind::StreamableHttp {
            self.extract_session(&client);
        }

        let tools = self.fetch_tools(&client).await;
        *self.tools_cache.write() = tools;
        Ok(())
    }

    /// Inspect the transport handle for an assigned session id.
    fn extract_session(&self, client: &Arc<RpcClient>) {
        let Some(id) = client.transport().session_id() else {
            return;
        };
        if !is_valid_session_id(&id) {
            debug!(server = %self.server, "ignoring invalid session id (stateless server)");
            return;
        }
        if self.session.read().as_ref().map(|s| s.id.as_str()) == Some(id.as_str()) {
            return;
        }

        *self.session.write() = Some(SessionRecord::new(&id));
        info!(server = %self.server, session = %id, "session established");
        self.emit(ConnectionEvent::SessionCreated { session_id: id });
    }

    async fn await_authorization(&self, trigger: String) -> Result<(), McpError> {
        self.awaiting_oauth.store(true, Ordering::SeqCst);
        let mut rx = self.events.subscribe();

        info!(
            server = %self.server,
            principal = %self.principal,
            "authorization required, waiting on coordinator"
        );
        self.emit(ConnectionEvent::OAuthRequired {
            server: self.server.clone(),
            principal: self.principal.clone(),
            server_url: self.config.url.clone(),
            error: trigger,
        });

        let timeout = self
            .config
            .init_timeout
            .map(Duration::from_millis)
            .unwrap_or(OAUTH_DEFAULT_TIMEOUT);
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(ConnectionEvent::OAuthHandled) => return Ok(()),
                    Ok(ConnectionEvent::OAuthFailed { error }) => return Err(error),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err("event channel closed".to_string())
                    }
                }
            }
        })
        .await;
        self.awaiting_oauth.store(false, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(McpError::AuthorizationFailed {
                server: self.server.clone(),
                principal: self.principal.clone(),
                reason: error,
            }),
            Err(_) => Err(McpError::AuthorizationFailed {
                server: self.server.clone(),
                principal: self.principal.clone(),
                reason: format!("authorization timed out after {timeout:?}"),
            }),
        }
    }

    fn spawn_router(
        self: &Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        client: Arc<RpcClient>,
    ) {
        if let Some(old) = self.router.lock().take() {
            old.abort();
        }

        let conn = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(conn) = conn.upgrade() else { break };
                match event {
                    TransportEvent::Opened => {
                        debug!(server = %conn.server, "transport opened");
                    }
                    TransportEvent::Message(frame) => match client.dispatch(frame) {
                        Some(Inbound::Request { id, method, .. }) => {
                            if method == "ping" {
                                if let Err(e) = client.reply_empty(id).await {
                                    debug!(server = %conn.server, error = %e, "ping reply suppressed");
                                }
                            } else {
                                client.reply_method_not_found(id, &method).await;
                            }
                        }
                        Some(Inbound::Notification { method, .. }) => {
                            if method == "notifications/resources/list_changed" {
                                conn.emit(ConnectionEvent::ResourcesChanged);
                            } else {
                                debug!(server = %conn.server, method, "unhandled notification");
                            }
                        }
                        None => {}
                    },
                    TransportEvent::Error(message) => {
                        conn.handle_transport_error(&message);
                    }
                    TransportEvent::Closed => {
                        // Terminal: anything still in flight will never be
                        // answered.
                        client.fail_all_pending("transport closed");
                        if conn.state() != ConnectionState::Disconnected {
                            conn.handle_transport_error("transport closed unexpectedly");
                        }
                        break;
                    }
                }
            }
        });
        *self.router.lock() = Some(handle);
    }

    fn handle_transport_error(self: &Arc<Self>, message: &str) {
        let has_live_session = self
            .session
            .read()
            .as_ref()
            .map(|s| !s.terminated)
            .unwrap_or(false);

        if self.kind == TransportKind::StreamableHttp && has_live_session {
            if let Some(kind) = classify_session_error(message) {
                warn!(server = %self.server, %kind, error = %message, "session error");
                self.emit(ConnectionEvent::SessionError { kind });

                if kind.is_recoverable() {
                    // Recovery is first-class: no generic error transition.
                    if !self.initializing.load(Ordering::SeqCst) {
                        self.spawn_session_recovery();
                    }
                    return;
                }
                // Invalid session: surface it, and start the next connect
                // without the stale id.
                *self.session.write() = None;
            }
        }

        if self.initializing.load(Ordering::SeqCst) || self.awaiting_oauth.load(Ordering::SeqCst) {
            debug!(server = %self.server, error = %message, "transport error during connect");
            return;
        }

        warn!(server = %self.server, error = %message, "transport error");
        self.emit(ConnectionEvent::Error {
            message: message.to_string(),
        });
        self.set_state(ConnectionState::Error);
        self.maybe_spawn_reconnect();
    }

    /// Clear the session, drop the transport, wait, and connect fresh.
    fn spawn_session_recovery(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.clone();
        tokio::spawn(async move {
            info!(server = %conn.server, "recovering streaming session");
            *conn.session.write() = None;
            conn.teardown_transport("session recovery").await;
            tokio::time::sleep(SESSION_RECOVERY_DELAY).await;
            conn.reconnecting.store(false, Ordering::SeqCst);

            if let Err(e) = conn.connect().await {
                warn!(server = %conn.server, error = %e, "session recovery failed");
                conn.maybe_spawn_reconnect();
            }
        });
    }

    /// Run the bounded reconnect loop, if no other loop owns the connection.
    fn maybe_spawn_reconnect(self: &Arc<Self>) {
        if self.stop_reconnecting.load(Ordering::SeqCst)
            || self.initializing.load(Ordering::SeqCst)
            || self.awaiting_oauth.load(Ordering::SeqCst)
        {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.clone();
        let policy = self.reconnect_policy.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if conn.stop_reconnecting.load(Ordering::SeqCst) {
                    break;
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        server = %conn.server,
                        attempts = attempt,
                        "giving up reconnecting"
                    );
                    break;
                }

                let delay = policy.delay(attempt);
                conn.set_state(ConnectionState::Reconnecting);
                conn.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
                debug!(server = %conn.server, attempt = attempt + 1, ?delay, "reconnect scheduled");
                tokio::time::sleep(delay).await;
                attempt += 1;

                match conn.connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(server = %conn.server, attempt, error = %e, "reconnect attempt failed");
                    }
                }
            }
            conn.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn teardown_transport(&self, reason: &str) {
        if let Some(old) = self.router.lock().take() {
            old.abort();
        }
        let client = self.client.write().take();
        if let Some(client) = client {
            client.fail_all_pending(reason);
            let _ = client.transport().close().await;
        }
    }

    /// Gracefully shut down. On streaming-HTTP with a live session, the
    /// explicit end-of-session request goes out first. Safe in any state.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        self.stop_reconnecting.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        let client = self.client.read().clone();
        if let Some(client) = client {
            let live_session = self
                .session
                .read()
                .as_ref()
                .filter(|s| !s.terminated)
                .map(|s| s.id.clone());
            if let Some(session_id) = live_session {
                match client.transport().terminate_session().await {
                    Ok(SessionTermination::Terminated) => {
                        if let Some(record) = self.session.write().as_mut() {
                            record.terminated = true;
                        }
                        self.emit(ConnectionEvent::SessionTerminated { session_id });
                    }
                    Ok(SessionTermination::Unsupported) => {
                        debug!(server = %self.server, "explicit session termination unsupported");
                    }
                    Ok(SessionTermination::SoftFailure(reason)) => {
                        warn!(server = %self.server, %reason, "session termination soft-failed");
                    }
                    Err(e) => {
                        warn!(server = %self.server, error = %e, "session termination errored");
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.teardown_transport("disconnect").await;
        *self.session.write() = None;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.stop_reconnecting.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Active liveness probe: state must be `connected` and a ping must
    /// round-trip.
    pub async fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let client = self.client.read().clone();
        match client {
            Some(client) => client.request("ping", None, PING_TIMEOUT).await.is_ok(),
            None => false,
        }
    }

    fn current_client(&self) -> Result<Arc<RpcClient>, McpError> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| McpError::transport(&self.server, "no active client"))
    }

    /// Issue a `tools/call`. The connection must be `connected`; calls are
    /// never attempted through an errored connection.
    pub async fn call(
        &self,
        tool: &str,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(McpError::transport(
                &self.server,
                format!("cannot call '{tool}' while {state}"),
            ));
        }
        let client = self.current_client()?;

        let mut params = json!({ "name": tool });
        if let Some(args) = args {
            params["arguments"] = args;
        }
        let timeout = timeout.unwrap_or_else(|| self.config.call_timeout());

        match client.request("tools/call", Some(params), timeout).await {
            Ok(result) => Ok(result),
            Err(RpcFailure::Timeout(d)) => {
                Err(McpError::timeout(&self.server, &format!("tools/call {tool}"), d))
            }
            Err(RpcFailure::Rpc { message, .. }) => Err(McpError::Tool {
                server: self.server.clone(),
                tool: tool.to_string(),
                reason: message,
            }),
            Err(RpcFailure::Channel(message)) => Err(McpError::transport(&self.server, message)),
        }
    }

    async fn fetch_tools(&self, client: &Arc<RpcClient>) -> Vec<ToolInfo> {
        match client
            .request("tools/list", None, self.config.call_timeout())
            .await
        {
            Ok(result) => serde_json::from_value::<Vec<ToolInfo>>(
                result.get("tools").cloned().unwrap_or(json!([])),
            )
            .unwrap_or_default(),
            Err(failure) => {
                debug!(server = %self.server, error = %failure.render(), "tools/list failed");
                Vec::new()
            }
        }
    }

    /// Best-effort discovery listing. Logs and returns empty on error.
    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        let Ok(client) = self.current_client() else {
            return Vec::new();
        };
        let tools = self.fetch_tools(&client).await;
        if !tools.is_empty() {
            *self.tools_cache.write() = tools.clone();
        }
        tools
    }

    /// Best-effort discovery listing. Logs and returns empty on error.
    pub async fn list_resources(&self) -> Vec<Value> {
        self.best_effort_list("resources/list", "resources").await
    }

    /// Best-effort discovery listing. Logs and returns empty on error.
    pub async fn list_prompts(&self) -> Vec<Value> {
        self.best_effort_list("prompts/list", "prompts").await
    }

    async fn best_effort_list(&self, method: &str, field: &str) -> Vec<Value> {
        let Ok(client) = self.current_client() else {
            return Vec::new();
        };
        match client.request(method, None, self.config.call_timeout()).await {
            Ok(result) => result
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(failure) => {
                debug!(server = %self.server, method, error = %failure.render(), "listing failed");
                Vec::new()
            }
        }
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.write();
            if *state == to {
                return;
            }
            let from = *state;
            *state = to;
            from
        };
        debug!(server = %self.server, %from, %to, "state change");
        self.emit(ConnectionEvent::StateChange { from, to });
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
    }
}
