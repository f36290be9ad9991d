//! Pool manager - the top-level facade over scoped connections.
//!
//! Holds the process-scope pool (established at startup for every
//! configured server) and the thread-scope pool (created lazily per
//! (thread, server) on first use), tracks last activity per thread and per
//! user, reclaims idle scopes, dispatches tool calls to the right scope,
//! and cascades shutdown.
//!
//! The manager is process-wide by policy: `initialize` installs the handle
//! in a process slot and rejects double initialization; embedding code may
//! also hold the returned handle explicitly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use dashmap::DashMap;
use futures::future::join_all;
use mcpool_core::{
    FlowStore, McpError, ServerConfig, TokenStore, POOL_INIT_TIMEOUT, SYSTEM_PRINCIPAL,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ReconnectPolicy, ToolInfo};
use crate::oauth::{OAuthCoordinator, OAuthStartHook};
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// Delimiter joining tool and server in namespaced tool keys.
pub const MCP_DELIMITER: &str = "_mcp_";

/// Idle window before a thread's connections are reclaimed. Generous so
/// long interactive flows outlive thread-id reassignment.
pub const DEFAULT_THREAD_IDLE: Duration = Duration::from_secs(60 * 60);

/// Idle window before a user's threads are reclaimed, a coarser safety net.
pub const DEFAULT_USER_IDLE: Duration = Duration::from_secs(15 * 60);

const INIT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_INIT_RETRY_DELAY: Duration = Duration::from_millis(2000);

static INSTANCE: parking_lot::RwLock<Option<Arc<McpManager>>> = parking_lot::RwLock::new(None);

/// Initialize the process-wide manager: build it, install the handle, and
/// establish the process-scope pool.
pub async fn initialize_mcp(
    servers: HashMap<String, ServerConfig>,
    flow_store: Arc<dyn FlowStore>,
    token_store: Arc<dyn TokenStore>,
) -> Result<Arc<McpManager>, McpError> {
    McpManager::builder(servers, flow_store, token_store)
        .initialize()
        .await
}

/// The process-wide manager, if initialized. Each access runs a
/// reclamation pass in the background.
pub fn get_instance() -> Option<Arc<McpManager>> {
    let manager = INSTANCE.read().clone();
    if let Some(manager) = &manager {
        manager.spawn_reclamation(None);
    }
    manager
}

/// Tear down the process-wide manager and every connection it holds.
pub async fn destroy_instance() {
    let manager = INSTANCE.write().take();
    if let Some(manager) = manager {
        manager.shutdown().await;
    }
}

/// Namespaced tool entry for downstream manifests.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestTool {
    /// `<tool><delimiter><server>` key, collision-free across servers.
    pub tool_key: String,
    pub name: String,
    pub server: String,
    pub description: Option<String>,
    pub icon_path: Option<String>,
}

pub struct McpManagerBuilder {
    configs: HashMap<String, ServerConfig>,
    flow_store: Arc<dyn FlowStore>,
    token_store: Arc<dyn TokenStore>,
    factory: Arc<dyn TransportFactory>,
    thread_idle: Duration,
    user_idle: Duration,
    reconnect_policy: ReconnectPolicy,
    init_retry_delay: Duration,
    oauth_start: Option<OAuthStartHook>,
}

impl McpManagerBuilder {
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_idle_timeouts(mut self, thread_idle: Duration, user_idle: Duration) -> Self {
        self.thread_idle = thread_idle;
        self.user_idle = user_idle;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_init_retry_delay(mut self, delay: Duration) -> Self {
        self.init_retry_delay = delay;
        self
    }

    pub fn with_oauth_start(mut self, hook: OAuthStartHook) -> Self {
        self.oauth_start = Some(hook);
        self
    }

    fn build_manager(self) -> Arc<McpManager> {
        let coordinator = Arc::new(OAuthCoordinator::new(self.flow_store, self.token_store));
        if let Some(hook) = self.oauth_start {
            coordinator.set_oauth_start(hook);
        }

        Arc::new(McpManager {
            configs: self.configs,
            coordinator,
            factory: self.factory,
            process_connections: DashMap::new(),
            thread_connections: DashMap::new(),
            thread_last_activity: DashMap::new(),
            user_last_activity: DashMap::new(),
            user_threads: DashMap::new(),
            server_instructions: DashMap::new(),
            creation_locks: DashMap::new(),
            thread_idle: self.thread_idle,
            user_idle: self.user_idle,
            reconnect_policy: self.reconnect_policy,
            init_retry_delay: self.init_retry_delay,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Build without installing the process-wide handle. The caller owns
    /// startup (`McpManager::startup`).
    pub fn build(self) -> Arc<McpManager> {
        self.build_manager()
    }

    /// Build, install as the one manager for this process, and connect the
    /// process scope.
    pub async fn initialize(self) -> Result<Arc<McpManager>, McpError> {
        let manager = self.build_manager();
        {
            let mut slot = INSTANCE.write();
            if slot.is_some() {
                return Err(McpError::Other(anyhow!(
                    "mcp manager already initialized for this process"
                )));
            }
            *slot = Some(manager.clone());
        }
        manager.startup().await;
        Ok(manager)
    }
}

pub struct McpManager {
    /// Immutable server registry.
    configs: HashMap<String, ServerConfig>,
    coordinator: Arc<OAuthCoordinator>,
    factory: Arc<dyn TransportFactory>,

    process_connections: DashMap<String, Arc<Connection>>,
    thread_connections: DashMap<String, HashMap<String, Arc<Connection>>>,
    thread_last_activity: DashMap<String, Instant>,
    user_last_activity: DashMap<String, Instant>,
    /// Reverse index user -> threads. Threads are owned by
    /// `thread_connections`; removal must update both.
    user_threads: DashMap<String, HashSet<String>>,
    server_instructions: DashMap<String, String>,
    /// Per-(scope, server) creation locks so concurrent acquisitions share
    /// one build.
    creation_locks: DashMap<String, Arc<Mutex<()>>>,

    thread_idle: Duration,
    user_idle: Duration,
    reconnect_policy: ReconnectPolicy,
    init_retry_delay: Duration,
    shutting_down: AtomicBool,
}

impl McpManager {
    pub fn builder(
        configs: HashMap<String, ServerConfig>,
        flow_store: Arc<dyn FlowStore>,
        token_store: Arc<dyn TokenStore>,
    ) -> McpManagerBuilder {
        McpManagerBuilder {
            configs,
            flow_store,
            token_store,
            factory: Arc::new(DefaultTransportFactory),
            thread_idle: DEFAULT_THREAD_IDLE,
            user_idle: DEFAULT_USER_IDLE,
            reconnect_policy: ReconnectPolicy::default(),
            init_retry_delay: DEFAULT_INIT_RETRY_DELAY,
            oauth_start: None,
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn coordinator(&self) -> Arc<OAuthCoordinator> {
        self.coordinator.clone()
    }

    /// Establish process-scope connections for every configured server.
    /// Individual failures are logged; the rest of the pool comes up.
    pub async fn startup(self: &Arc<Self>) {
        info!(servers = self.configs.len(), "establishing process-scope pool");

        let tasks = self.configs.keys().cloned().map(|server| {
            let manager = self.clone();
            async move {
                match manager.create_process_connection(&server).await {
                    Ok(conn) => {
                        manager.process_connections.insert(server.clone(), conn);
                        info!(server = %server, "process-scope connection ready");
                    }
                    Err(e) => {
                        error!(server = %server, error = %e, "process-scope connection failed");
                    }
                }
            }
        });
        join_all(tasks).await;
    }

    async fn create_process_connection(
        self: &Arc<Self>,
        server: &str,
    ) -> Result<Arc<Connection>, McpError> {
        let config = self.configs.get(server).ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "unknown server".to_string(),
        })?;

        let tokens = self
            .coordinator
            .load_tokens(SYSTEM_PRINCIPAL, server, config)
            .await;

        let conn = Arc::new(
            Connection::new(
                server,
                config.clone(),
                SYSTEM_PRINCIPAL,
                None,
                self.factory.clone(),
                Some(POOL_INIT_TIMEOUT),
            )?
            .with_reconnect_policy(self.reconnect_policy.clone()),
        );
        if let Some(tokens) = tokens {
            conn.set_auth_tokens(tokens);
        }
        self.coordinator.attach(&conn);

        self.initialize_server(&conn).await?;

        if let Some(instructions) = conn.server_instructions() {
            self.server_instructions
                .insert(server.to_string(), instructions);
        }
        Ok(conn)
    }

    /// Connect with up to three attempts and a linear delay between them.
    /// Authorization errors short-circuit: the connection already ran the
    /// coordinator round-trip inside `connect`.
    pub(crate) async fn initialize_server(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<(), McpError> {
        let mut last_error = None;
        for attempt in 1..=INIT_RETRY_ATTEMPTS {
            match conn.connect().await {
                Ok(()) => return Ok(()),
                Err(
                    e @ (McpError::AuthorizationRequired { .. }
                    | McpError::AuthorizationFailed { .. }),
                ) => return Err(e),
                Err(e) => {
                    warn!(
                        server = %conn.server(),
                        attempt,
                        error = %e,
                        "server initialization attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < INIT_RETRY_ATTEMPTS {
                        tokio::time::sleep(self.init_retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(McpError::Shutdown))
    }

    /// Dispatch a tool call to the right scope:
    /// user + thread -> thread scope (created on demand); anything else ->
    /// the process-scope connection.
    pub async fn call_tool(
        self: &Arc<Self>,
        user_id: Option<&str>,
        thread_id: Option<&str>,
        server: &str,
        tool: &str,
        args: Option<Value>,
        custom_user_vars: Option<&HashMap<String, String>>,
    ) -> Result<Value, McpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::Shutdown);
        }

        // Lazy reclamation pass; the calling user is exempt from user-level
        // reaping so a stale activity read cannot tear their threads down
        // mid-call.
        self.spawn_reclamation(user_id);

        let conn = match (user_id, thread_id) {
            (Some(user), Some(thread)) => {
                self.get_thread_connection(user, thread, server, custom_user_vars)
                    .await?
            }
            _ => self.get_process_connection(server).await?,
        };

        let result = conn.call(tool, args, None).await?;

        if let Some(user) = user_id {
            if let Some(thread) = thread_id {
                self.touch(user, thread);
            } else {
                self.user_last_activity
                    .insert(user.to_string(), Instant::now());
            }
        }
        Ok(result)
    }

    /// The process-scope connection for a server, re-established if dead.
    pub async fn get_process_connection(
        self: &Arc<Self>,
        server: &str,
    ) -> Result<Arc<Connection>, McpError> {
        if !self.configs.contains_key(server) {
            return Err(McpError::Configuration {
                server: server.to_string(),
                reason: "unknown server".to_string(),
            });
        }

        let lock = self.creation_lock(&format!("process:{server}"));
        let _guard = lock.lock().await;

        if let Some(conn) = self.process_connections.get(server).map(|e| e.clone()) {
            if conn.is_connected().await {
                return Ok(conn);
            }
            self.initialize_server(&conn).await?;
            return Ok(conn);
        }

        // Startup failed for this server; build it now.
        let conn = self.create_process_connection(server).await?;
        self.process_connections
            .insert(server.to_string(), conn.clone());
        Ok(conn)
    }

    /// Thread-scope acquisition: reuse a fresh healthy connection, tear
    /// down stale or dead ones, create on demand.
    pub async fn get_thread_connection(
        self: &Arc<Self>,
        user_id: &str,
        thread_id: &str,
        server: &str,
        custom_user_vars: Option<&HashMap<String, String>>,
    ) -> Result<Arc<Connection>, McpError> {
        if user_id.is_empty() || thread_id.is_empty() {
            return Err(McpError::Configuration {
                server: server.to_string(),
                reason: "thread-scope connections require a user id and a thread id".to_string(),
            });
        }

        let lock = self.creation_lock(&format!("{thread_id}:{server}"));
        let _guard = lock.lock().await;

        let existing = self
            .thread_connections
            .get(thread_id)
            .and_then(|m| m.get(server).cloned());
        if let Some(conn) = existing {
            let age = self
                .thread_last_activity
                .get(thread_id)
                .map(|t| t.elapsed());
            let fresh = age.map(|a| a <= self.thread_idle).unwrap_or(false);

            if fresh {
                // Re-validate after the map read; never hand out a
                // connection whose teardown has started.
                if conn.is_connected().await {
                    self.touch(user_id, thread_id);
                    return Ok(conn);
                }
                debug!(server = %server, thread = %thread_id, "dropping dead thread connection");
                if let Some(mut entry) = self.thread_connections.get_mut(thread_id) {
                    entry.remove(server);
                }
                let stale = conn;
                tokio::spawn(async move {
                    let _ = stale.disconnect().await;
                });
            } else {
                debug!(thread = %thread_id, "thread idle window elapsed, tearing down its scope");
                self.disconnect_thread_connections(thread_id).await;
            }
        }

        let config = self
            .configs
            .get(server)
            .ok_or_else(|| McpError::Configuration {
                server: server.to_string(),
                reason: "unknown server".to_string(),
            })?;
        let empty_vars = HashMap::new();
        let resolved = config.resolve_user_vars(user_id, custom_user_vars.unwrap_or(&empty_vars));

        let tokens = self.coordinator.load_tokens(user_id, server, &resolved).await;

        let conn = Arc::new(
            Connection::new(
                server,
                resolved,
                user_id,
                Some(thread_id.to_string()),
                self.factory.clone(),
                Some(POOL_INIT_TIMEOUT),
            )?
            .with_reconnect_policy(self.reconnect_policy.clone()),
        );
        if let Some(tokens) = tokens {
            conn.set_auth_tokens(tokens);
        }
        self.coordinator.attach(&conn);

        match self.initialize_server(&conn).await {
            Ok(()) => {
                self.thread_connections
                    .entry(thread_id.to_string())
                    .or_default()
                    .insert(server.to_string(), conn.clone());
                self.user_threads
                    .entry(user_id.to_string())
                    .or_default()
                    .insert(thread_id.to_string());
                self.touch(user_id, thread_id);
                info!(server = %server, user = %user_id, thread = %thread_id, "thread-scope connection ready");
                Ok(conn)
            }
            Err(e) => {
                let _ = conn.disconnect().await;
                Err(e)
            }
        }
    }

    fn creation_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn touch(&self, user_id: &str, thread_id: &str) {
        let now = Instant::now();
        self.thread_last_activity
            .insert(thread_id.to_string(), now);
        self.user_last_activity.insert(user_id.to_string(), now);
    }

    /// Fire-and-forget reclamation pass. Runs on every `get_instance()`
    /// access (no active user known there) and lazily on each `call_tool`
    /// entry, which passes the calling user.
    pub fn spawn_reclamation(self: &Arc<Self>, active_user: Option<&str>) {
        let manager = self.clone();
        let active_user = active_user.map(str::to_string);
        tokio::spawn(async move {
            manager.check_idle_connections(active_user.as_deref()).await;
        });
    }

    /// Schedule teardown of idle threads and idle users. `active_user`
    /// names the user whose request triggered this pass; that user is
    /// exempt from user-level reclamation.
    pub async fn check_idle_connections(self: &Arc<Self>, active_user: Option<&str>) {
        let stale_threads: Vec<String> = self
            .thread_last_activity
            .iter()
            .filter(|e| e.value().elapsed() > self.thread_idle)
            .map(|e| e.key().clone())
            .collect();
        for thread in stale_threads {
            debug!(thread = %thread, "reclaiming idle thread");
            let manager = self.clone();
            tokio::spawn(async move {
                manager.disconnect_thread_connections(&thread).await;
            });
        }

        let stale_users: Vec<String> = self
            .user_last_activity
            .iter()
            .filter(|e| e.value().elapsed() > self.user_idle && Some(e.key().as_str()) != active_user)
            .map(|e| e.key().clone())
            .collect();
        for user in stale_users {
            debug!(user = %user, "reclaiming idle user");
            let manager = self.clone();
            tokio::spawn(async move {
                manager.disconnect_user_threads(&user).await;
            });
        }
    }

    /// Tear down every connection in one thread's scope and drop the
    /// thread from both indexes.
    pub async fn disconnect_thread_connections(&self, thread_id: &str) {
        let connections = self
            .thread_connections
            .remove(thread_id)
            .map(|(_, m)| m)
            .unwrap_or_default();
        self.thread_last_activity.remove(thread_id);

        let mut drained_users = Vec::new();
        for mut entry in self.user_threads.iter_mut() {
            if entry.value_mut().remove(thread_id) && entry.value().is_empty() {
                drained_users.push(entry.key().clone());
            }
        }
        for user in drained_users {
            self.user_threads
                .remove_if(&user, |_, threads| threads.is_empty());
        }

        let disconnects = connections.into_iter().map(|(server, conn)| async move {
            if let Err(e) = conn.disconnect().await {
                warn!(server = %server, error = %e, "thread connection disconnect failed");
            }
        });
        join_all(disconnects).await;
    }

    /// Tear down every thread owned by a user.
    pub async fn disconnect_user_threads(&self, user_id: &str) {
        let threads = self
            .user_threads
            .remove(user_id)
            .map(|(_, t)| t)
            .unwrap_or_default();
        for thread in threads {
            self.disconnect_thread_connections(&thread).await;
        }
        self.user_last_activity.remove(user_id);
    }

    /// Tear down everything: all thread scopes per user, all activity
    /// indexes, then the process-scope pool. Idempotent; disconnect errors
    /// are logged, not propagated.
    pub async fn disconnect_all(&self) {
        let users: Vec<String> = self.user_threads.iter().map(|e| e.key().clone()).collect();
        for user in users {
            self.disconnect_user_threads(&user).await;
        }
        let leftover: Vec<String> = self
            .thread_connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for thread in leftover {
            self.disconnect_thread_connections(&thread).await;
        }
        self.thread_last_activity.clear();
        self.user_last_activity.clear();

        let process: Vec<(String, Arc<Connection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let disconnects = process.into_iter().map(|(server, conn)| async move {
            if let Err(e) = conn.disconnect().await {
                error!(server = %server, error = %e, "process connection disconnect failed");
            }
        });
        join_all(disconnects).await;
    }

    async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.disconnect_all().await;
    }

    /// Project every process-scope server's tools into `out`, keyed
    /// `<tool><delimiter><server>`. Dead servers are reconnected first
    /// unless `verify_health` is false; individual failures are logged and
    /// skipped.
    pub async fn map_available_tools(
        self: &Arc<Self>,
        out: &mut HashMap<String, ToolInfo>,
        verify_health: bool,
    ) {
        let connections: Vec<(String, Arc<Connection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (server, conn) in connections {
            if verify_health && !conn.is_connected().await {
                if let Err(e) = self.initialize_server(&conn).await {
                    warn!(server = %server, error = %e, "skipping unreachable server in tool map");
                    continue;
                }
            }
            for tool in conn.list_tools().await {
                out.insert(format!("{}{}{}", tool.name, MCP_DELIMITER, server), tool);
            }
        }
    }

    /// Manifest projection of every process-scope server's tools.
    pub async fn load_manifest_tools(
        self: &Arc<Self>,
        verify_health: bool,
    ) -> Vec<ManifestTool> {
        let connections: Vec<(String, Arc<Connection>)> = self
            .process_connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut manifest = Vec::new();
        for (server, conn) in connections {
            if verify_health && !conn.is_connected().await {
                if let Err(e) = self.initialize_server(&conn).await {
                    warn!(server = %server, error = %e, "skipping unreachable server in manifest");
                    continue;
                }
            }
            let icon_path = self
                .configs
                .get(&server)
                .and_then(|c| c.icon_path.clone());
            for tool in conn.list_tools().await {
                manifest.push(ManifestTool {
                    tool_key: format!("{}{}{}", tool.name, MCP_DELIMITER, server),
                    name: tool.name,
                    server: server.clone(),
                    description: tool.description,
                    icon_path: icon_path.clone(),
                });
            }
        }
        manifest
    }

    /// Server-supplied (or overridden) instructions resolved at startup.
    pub fn get_server_instructions(&self, server: &str) -> Option<String> {
        self.server_instructions.get(server).map(|e| e.clone())
    }

    // --- introspection, mostly for embedding apps and tests ---

    pub fn process_connection(&self, server: &str) -> Option<Arc<Connection>> {
        self.process_connections.get(server).map(|e| e.clone())
    }

    pub fn thread_connection(&self, thread_id: &str, server: &str) -> Option<Arc<Connection>> {
        self.thread_connections
            .get(thread_id)
            .and_then(|m| m.get(server).cloned())
    }

    pub fn thread_count(&self) -> usize {
        self.thread_connections.len()
    }

    pub fn user_threads_snapshot(&self, user_id: &str) -> HashSet<String> {
        self.user_threads
            .get(user_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn has_thread_activity(&self, thread_id: &str) -> bool {
        self.thread_last_activity.contains_key(thread_id)
    }

    pub fn thread_last_activity(&self, thread_id: &str) -> Option<Instant> {
        self.thread_last_activity.get(thread_id).map(|e| *e)
    }

    pub fn user_last_activity(&self, user_id: &str) -> Option<Instant> {
        self.user_last_activity.get(user_id).map(|e| *e)
    }
}

#[cfg(test)]
mod tests {
    use mcpool_core::{InMemoryFlowStore, InMemoryTokenStore};
    use serde_json::json;

    use crate::transport::testing::MockServer;

    use super::*;

    fn calc_configs() -> HashMap<String, ServerConfig> {
        HashMap::from([(
            "calc".to_string(),
            serde_json::from_str(r#"{"command": "./calc"}"#).unwrap(),
        )])
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            cap: Duration::from_millis(40),
        }
    }

    async fn manager_with(
        configs: HashMap<String, ServerConfig>,
        server: &MockServer,
    ) -> Arc<McpManager> {
        let manager = McpManager::builder(
            configs,
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryTokenStore::new()),
        )
        .with_factory(Arc::new(server.clone()))
        .with_reconnect_policy(fast_policy())
        .with_init_retry_delay(Duration::from_millis(10))
        .build();
        manager.startup().await;
        manager
    }

    #[tokio::test]
    async fn test_startup_establishes_process_scope() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        let conn = manager.process_connection("calc").unwrap();
        assert_eq!(
            conn.state(),
            mcpool_core::ConnectionState::Connected
        );

        let mut out = HashMap::new();
        manager.map_available_tools(&mut out, true).await;
        assert!(out.contains_key("add_mcp_calc"));
    }

    #[tokio::test]
    async fn test_process_scope_dispatch_without_thread() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        // User without a thread id collapses to process scope.
        let result = manager
            .call_tool(Some("u1"), None, "calc", "add", Some(json!({"a": 1})), None)
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
        assert_eq!(manager.thread_count(), 0);
        assert!(manager.user_last_activity("u1").is_some());
    }

    #[tokio::test]
    async fn test_thread_scope_creation_and_reuse() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        manager
            .call_tool(
                Some("u1"),
                Some("t1"),
                "calc",
                "add",
                Some(json!({"a": 1, "b": 2})),
                None,
            )
            .await
            .unwrap();
        let first = manager.thread_connection("t1", "calc").unwrap();

        manager
            .call_tool(Some("u1"), Some("t1"), "calc", "add", None, None)
            .await
            .unwrap();
        let second = manager.thread_connection("t1", "calc").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.user_threads_snapshot("u1").contains("t1"));
        assert!(manager.thread_last_activity("t1").unwrap().elapsed() < Duration::from_secs(1));
        assert!(manager.user_last_activity("u1").unwrap().elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_concurrent_thread_acquisition_shares_one_connection() {
        let server = MockServer::new();
        server.set_reply_latency(Duration::from_millis(20));
        let manager = manager_with(calc_configs(), &server).await;
        let connects_before = server.connect_count();

        let spawn = |manager: Arc<McpManager>| {
            tokio::spawn(async move {
                manager
                    .get_thread_connection("u1", "t1", "calc", None)
                    .await
            })
        };
        let a = spawn(manager.clone());
        let b = spawn(manager.clone());

        let ca = a.await.unwrap().unwrap();
        let cb = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&ca, &cb));
        assert_eq!(server.connect_count(), connects_before + 1);
    }

    #[tokio::test]
    async fn test_unknown_server_is_configuration_error() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        let err = manager
            .call_tool(None, None, "ghost", "add", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration { .. }));

        let err = manager
            .get_thread_connection("u1", "t1", "ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_thread_scope_requires_ids() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        let err = manager
            .get_thread_connection("", "t1", "calc", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_idle_thread_reclamation() {
        let server = MockServer::new();
        let manager = McpManager::builder(
            calc_configs(),
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryTokenStore::new()),
        )
        .with_factory(Arc::new(server.clone()))
        .with_idle_timeouts(Duration::from_millis(50), Duration::from_secs(600))
        .with_init_retry_delay(Duration::from_millis(10))
        .build();
        manager.startup().await;

        manager
            .call_tool(Some("u1"), Some("t1"), "calc", "add", None, None)
            .await
            .unwrap();
        assert!(manager.thread_connection("t1", "calc").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.check_idle_connections(None).await;

        // Reclamation is fire-and-forget; give it a beat to finish.
        for _ in 0..100 {
            if manager.thread_connection("t1", "calc").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.thread_connection("t1", "calc").is_none());
        assert!(!manager.has_thread_activity("t1"));
        assert!(!manager.user_threads_snapshot("u1").contains("t1"));
    }

    #[tokio::test]
    async fn test_user_reclamation_via_call_tool_spares_caller() {
        let server = MockServer::new();
        let manager = McpManager::builder(
            calc_configs(),
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryTokenStore::new()),
        )
        .with_factory(Arc::new(server.clone()))
        .with_idle_timeouts(Duration::from_secs(600), Duration::from_millis(50))
        .with_init_retry_delay(Duration::from_millis(10))
        .build();
        manager.startup().await;

        manager
            .call_tool(Some("u1"), Some("t1"), "calc", "add", None, None)
            .await
            .unwrap();
        manager
            .call_tool(Some("u2"), Some("t2"), "calc", "add", None, None)
            .await
            .unwrap();

        // Both users idle out. u2's next call triggers the lazy reclamation
        // pass; the reply latency keeps u2's activity entry stale while the
        // pass reads it, so only the exemption keeps u2 alive.
        tokio::time::sleep(Duration::from_millis(80)).await;
        server.set_reply_latency(Duration::from_millis(30));
        manager
            .call_tool(Some("u2"), Some("t2"), "calc", "add", None, None)
            .await
            .unwrap();

        for _ in 0..100 {
            if manager.user_threads_snapshot("u1").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.user_threads_snapshot("u1").is_empty());
        // The caller's threads survive user-level reclamation.
        assert!(manager.user_threads_snapshot("u2").contains("t2"));
        assert!(manager.thread_connection("t2", "calc").is_some());
    }

    #[tokio::test]
    async fn test_stale_thread_rebuilt_on_access() {
        let server = MockServer::new();
        let manager = McpManager::builder(
            calc_configs(),
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryTokenStore::new()),
        )
        .with_factory(Arc::new(server.clone()))
        .with_idle_timeouts(Duration::from_millis(50), Duration::from_secs(600))
        .with_init_retry_delay(Duration::from_millis(10))
        .build();
        manager.startup().await;

        let first = manager
            .get_thread_connection("u1", "t1", "calc", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The idle window elapsed: acquisition tears down and recreates.
        let second = manager
            .get_thread_connection("u1", "t1", "calc", None)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.state(),
            mcpool_core::ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_disconnect_all_is_idempotent() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        manager
            .call_tool(Some("u1"), Some("t1"), "calc", "add", None, None)
            .await
            .unwrap();

        manager.disconnect_all().await;
        assert_eq!(manager.thread_count(), 0);
        let proc = manager.process_connection("calc").unwrap();
        assert_eq!(proc.state(), mcpool_core::ConnectionState::Disconnected);

        // L3: a second pass has the same effect as one.
        manager.disconnect_all().await;
        assert_eq!(manager.thread_count(), 0);
        assert_eq!(proc.state(), mcpool_core::ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_per_user_variable_substitution_in_thread_scope() {
        let server = MockServer::new();
        let configs = HashMap::from([(
            "calc".to_string(),
            serde_json::from_str::<ServerConfig>(
                r#"{"command": "./calc", "env": {"OWNER": "{{USER_ID}}", "REGION": "{{REGION}}"}}"#,
            )
            .unwrap(),
        )]);
        let manager = manager_with(configs, &server).await;

        let vars = HashMap::from([("REGION".to_string(), "eu".to_string())]);
        let conn = manager
            .get_thread_connection("u1", "t1", "calc", Some(&vars))
            .await
            .unwrap();
        assert_eq!(conn.config().env["OWNER"], "u1");
        assert_eq!(conn.config().env["REGION"], "eu");
    }

    #[tokio::test]
    async fn test_manifest_tools_namespacing() {
        let server = MockServer::new();
        let manager = manager_with(calc_configs(), &server).await;

        let manifest = manager.load_manifest_tools(true).await;
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].tool_key, "add_mcp_calc");
        assert_eq!(manifest[0].server, "calc");
    }

    #[tokio::test]
    async fn test_server_instructions_resolved_at_startup() {
        let server = MockServer::new().with_instructions("handle with care");
        let configs = HashMap::from([(
            "calc".to_string(),
            serde_json::from_str::<ServerConfig>(
                r#"{"command": "./calc", "serverInstructions": true}"#,
            )
            .unwrap(),
        )]);
        let manager = manager_with(configs, &server).await;

        assert_eq!(
            manager.get_server_instructions("calc").as_deref(),
            Some("handle with care")
        );
    }
}
