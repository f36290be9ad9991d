//! End-to-end scenarios against the scripted in-process server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_client::pool::{destroy_instance, get_instance};
use mcpool_client::transport::testing::MockServer;
use mcpool_client::{McpManager, ReconnectPolicy};
use mcpool_core::{
    AuthTokens, ConnectionState, FlowStore, InMemoryFlowStore, InMemoryTokenStore, McpError,
    ServerConfig, TokenStore,
};
use serde_json::json;

fn stdio_configs(name: &str) -> HashMap<String, ServerConfig> {
    HashMap::from([(
        name.to_string(),
        serde_json::from_str(r#"{"command": "./calc"}"#).unwrap(),
    )])
}

fn streamable_configs(name: &str) -> HashMap<String, ServerConfig> {
    HashMap::from([(
        name.to_string(),
        serde_json::from_str(r#"{"type": "streamable-http", "url": "https://example.com/mcp"}"#)
            .unwrap(),
    )])
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        cap: Duration::from_millis(40),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Token store counting create/update calls, for single-flight assertions.
struct CountingTokenStore {
    inner: InMemoryTokenStore,
    creates: AtomicUsize,
}

impl CountingTokenStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTokenStore::new(),
            creates: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenStore for CountingTokenStore {
    async fn find_token(&self, principal: &str, server: &str) -> anyhow::Result<Option<AuthTokens>> {
        self.inner.find_token(principal, server).await
    }

    async fn create_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_token(principal, server, tokens).await
    }

    async fn update_token(
        &self,
        principal: &str,
        server: &str,
        tokens: AuthTokens,
    ) -> anyhow::Result<()> {
        self.inner.update_token(principal, server, tokens).await
    }
}

// Scenario: process-scope startup and namespaced tool listing.
#[tokio::test]
async fn scenario_process_startup_and_tool_listing() {
    let server = MockServer::new();
    let manager = McpManager::builder(
        stdio_configs("calc"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .with_init_retry_delay(Duration::from_millis(10))
    .build();
    manager.startup().await;

    let conn = manager.process_connection("calc").expect("calc registered");
    assert_eq!(conn.state(), ConnectionState::Connected);

    let mut out = HashMap::new();
    manager.map_available_tools(&mut out, true).await;
    let tool = &out["add_mcp_calc"];
    assert_eq!(tool.name, "add");
}

// Scenario: thread-scope creation and reuse across two calls.
#[tokio::test]
async fn scenario_thread_scope_creation_and_reuse() {
    let server = MockServer::new();
    let manager = McpManager::builder(
        stdio_configs("calc"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .with_init_retry_delay(Duration::from_millis(10))
    .build();
    manager.startup().await;

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
        .call_tool(
            Some("u1"),
            Some("t1"),
            "calc",
            "add",
            Some(json!({"a": 3, "b": 4})),
            None,
        )
        .await
        .unwrap();
    let second = manager.thread_connection("t1", "calc").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(manager.user_threads_snapshot("u1").contains("t1"));
    assert!(manager.thread_last_activity("t1").unwrap().elapsed() < Duration::from_millis(500));
    assert!(manager.user_last_activity("u1").unwrap().elapsed() < Duration::from_millis(500));
}

// Scenario: streaming-HTTP session extraction and explicit termination.
#[tokio::test]
async fn scenario_session_extraction_and_termination() {
    let server = MockServer::new();
    server.push_session_id("ABCD1234");
    let manager = McpManager::builder(
        streamable_configs("files"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .with_init_retry_delay(Duration::from_millis(10))
    .build();
    manager.startup().await;

    let conn = manager.process_connection("files").unwrap();
    let session = conn.session_info().expect("session extracted");
    assert_eq!(session.id, "ABCD1234");
    assert!(!session.terminated);

    manager.disconnect_all().await;
    assert_eq!(server.termination_count(), 1);
    assert!(conn.session_info().is_none());
}

// Scenario: session recovery after a 404-shaped transport error.
#[tokio::test]
async fn scenario_session_recovery_on_404() {
    let server = MockServer::new();
    server.push_session_id("S1");
    server.push_session_id("S2");
    let manager = McpManager::builder(
        streamable_configs("files"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .with_reconnect_policy(fast_policy())
    .with_init_retry_delay(Duration::from_millis(10))
    .build();
    manager.startup().await;

    let conn = manager.process_connection("files").unwrap();
    assert_eq!(conn.session_info().unwrap().id, "S1");

    server.inject_error("HTTP 404 Not Found: session not found");

    wait_until("session recovery", || {
        conn.session_info().map(|s| s.id == "S2").unwrap_or(false)
            && conn.state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(server.connect_count(), 2);
}

// Scenario: two concurrent callers, one authorization flow, one token write.
#[tokio::test]
async fn scenario_authorization_single_flight() {
    let server = MockServer::new();
    server.require_bearer("granted-token");

    let flow_store = Arc::new(InMemoryFlowStore::new());
    let token_store = Arc::new(CountingTokenStore::new());
    let urls = Arc::new(AtomicUsize::new(0));

    let configs = HashMap::from([(
        "gh".to_string(),
        serde_json::from_str::<ServerConfig>(
            r#"{
                "command": "./gh",
                "oauth": {"issuer_url": "https://auth.example.com", "client_id": "cid"}
            }"#,
        )
        .unwrap(),
    )]);

    let urls_for_hook = urls.clone();
    let flow_store_for_hook = flow_store.clone();
    let manager = McpManager::builder(configs, flow_store.clone(), token_store.clone())
        .with_factory(Arc::new(server.clone()))
        .with_init_retry_delay(Duration::from_millis(10))
        .with_oauth_start(Arc::new(move |_url| {
            urls_for_hook.fetch_add(1, Ordering::SeqCst);
            // Play the role of the embedding app: the browser round-trip
            // lands and resolves the flow with fresh tokens.
            let flow_store = flow_store_for_hook.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = flow_store
                    .complete_flow(
                        "u1:gh",
                        "mcp_oauth",
                        serde_json::to_value(AuthTokens::bearer("granted-token")).unwrap(),
                    )
                    .await;
            });
        }))
        .build();
    // No startup(): the process scope would run its own flow for the
    // system principal; this scenario exercises the shared user flow.

    let spawn_call = |manager: Arc<McpManager>, thread: &'static str| {
        tokio::spawn(async move {
            manager
                .call_tool(
                    Some("u1"),
                    Some(thread),
                    "gh",
                    "add",
                    Some(json!({"a": 1})),
                    None,
                )
                .await
        })
    };
    let a = spawn_call(manager.clone(), "t1");
    let b = spawn_call(manager.clone(), "t2");

    a.await.unwrap().expect("first caller succeeds after oauth");
    b.await.unwrap().expect("second caller succeeds after oauth");

    assert_eq!(urls.load(Ordering::SeqCst), 1, "one authorization url");
    assert_eq!(
        token_store.creates.load(Ordering::SeqCst),
        1,
        "one token write"
    );
    let stored = token_store.find_token("u1", "gh").await.unwrap().unwrap();
    assert_eq!(stored.access_token, "granted-token");
}

// Scenario: idle thread reclamation through the process-wide accessor, plus
// the install/destroy lifecycle. Kept as one test: the manager slot is
// process-global.
#[tokio::test]
async fn scenario_reclamation_and_manager_lifecycle() {
    let server = MockServer::new();
    server.push_session_id("P1");
    server.push_session_id("S1");

    let manager = McpManager::builder(
        streamable_configs("files"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .with_idle_timeouts(Duration::from_millis(50), Duration::from_secs(600))
    .with_init_retry_delay(Duration::from_millis(10))
    .initialize()
    .await
    .unwrap();

    // One manager per process.
    let second = McpManager::builder(
        streamable_configs("files"),
        Arc::new(InMemoryFlowStore::new()),
        Arc::new(InMemoryTokenStore::new()),
    )
    .with_factory(Arc::new(server.clone()))
    .initialize()
    .await;
    assert!(second.is_err());

    manager
        .call_tool(Some("u1"), Some("t1"), "files", "add", None, None)
        .await
        .unwrap();
    assert!(manager.thread_connection("t1", "files").is_some());

    // Let the thread idle out, then trigger the reaper via the accessor.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let handle = get_instance().expect("manager installed");
    assert!(Arc::ptr_eq(&handle, &manager));

    wait_until("idle thread reclamation", || {
        manager.thread_connection("t1", "files").is_none()
    })
    .await;
    assert!(!manager.has_thread_activity("t1"));
    assert!(manager.user_threads_snapshot("u1").is_empty());
    // The reclaimed thread connection terminated its streaming session.
    assert_eq!(server.termination_count(), 1);

    destroy_instance().await;
    assert!(get_instance().is_none());

    // A held handle refuses new work after shutdown.
    let err = manager
        .call_tool(Some("u1"), Some("t9"), "files", "add", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Shutdown));
}
