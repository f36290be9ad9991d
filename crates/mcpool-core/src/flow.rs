//! Flow store - serialized interactive flows with wait-for-completion
//! semantics.
//!
//! A flow is an exchange resolved outside the caller (a browser
//! authorization round-trip, a token load) identified by a deterministic id.
//! Creating a flow that already exists attaches the caller to the pending
//! flow instead of starting a second one, which is how concurrent demands on
//! the same (principal, server) collapse to a single interactive prompt.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Handler invoked by `create_flow_with_handler` when no flow with the given
/// id exists yet.
pub type FlowHandler = Box<dyn FnOnce() -> BoxFuture<anyhow::Result<Value>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FlowState {
    pub status: FlowStatus,
    pub metadata: Option<Value>,
}

/// Stateful key/value store of in-flight flows. Implementations must be
/// concurrency-safe; all blocking waits are bounded by the store's timeout.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Create a flow (or attach to an existing one) and block until it is
    /// resolved externally via `complete_flow` / `fail_flow`.
    async fn create_flow(
        &self,
        id: &str,
        kind: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<Value>;

    /// Invoke `handler` if no flow with this id exists; otherwise attach to
    /// the existing flow and return its eventual result.
    async fn create_flow_with_handler(
        &self,
        id: &str,
        kind: &str,
        handler: FlowHandler,
    ) -> anyhow::Result<Value>;

    async fn get_flow_state(&self, id: &str, kind: &str) -> anyhow::Result<Option<FlowState>>;

    async fn complete_flow(&self, id: &str, kind: &str, result: Value) -> anyhow::Result<()>;

    async fn fail_flow(&self, id: &str, kind: &str, error: &str) -> anyhow::Result<()>;
}

type FlowOutcome = Result<Value, String>;

struct FlowEntry {
    status: FlowStatus,
    metadata: Option<Value>,
    tx: watch::Sender<Option<FlowOutcome>>,
}

/// Default wall-clock bound on any flow wait.
const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(180);

/// In-memory flow store for embeddings that do not share flows across
/// processes, and for tests.
pub struct InMemoryFlowStore {
    flows: DashMap<String, FlowEntry>,
    timeout: Duration,
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            timeout: DEFAULT_FLOW_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flows: DashMap::new(),
            timeout,
        }
    }

    fn key(id: &str, kind: &str) -> String {
        format!("{kind}:{id}")
    }

    /// Subscribe to an existing pending flow, if any.
    fn attach(&self, key: &str) -> Option<watch::Receiver<Option<FlowOutcome>>> {
        self.flows.get(key).map(|entry| entry.tx.subscribe())
    }

    fn resolve(&self, key: &str, outcome: FlowOutcome) {
        if let Some((_, entry)) = self.flows.remove(key) {
            let _ = entry.tx.send(Some(outcome));
        }
    }

    async fn wait(
        &self,
        key: &str,
        mut rx: watch::Receiver<Option<FlowOutcome>>,
    ) -> anyhow::Result<Value> {
        let outcome = tokio::time::timeout(self.timeout, async {
            loop {
                let current = rx.borrow().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err("flow abandoned before resolution".to_string());
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(anyhow!("flow '{key}' failed: {error}")),
            Err(_) => {
                // Timed-out pending flows are reaped so a fresh attempt can start.
                self.flows.remove(key);
                Err(anyhow!(
                    "flow '{key}' timed out after {:?}",
                    self.timeout
                ))
            }
        }
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_flow(
        &self,
        id: &str,
        kind: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<Value> {
        let key = Self::key(id, kind);

        if let Some(rx) = self.attach(&key) {
            debug!(flow = %key, "attaching to pending flow");
            return self.wait(&key, rx).await;
        }

        let (tx, rx) = watch::channel(None);
        self.flows.insert(
            key.clone(),
            FlowEntry {
                status: FlowStatus::Pending,
                metadata,
                tx,
            },
        );
        debug!(flow = %key, "created flow");
        self.wait(&key, rx).await
    }

    async fn create_flow_with_handler(
        &self,
        id: &str,
        kind: &str,
        handler: FlowHandler,
    ) -> anyhow::Result<Value> {
        let key = Self::key(id, kind);

        if let Some(rx) = self.attach(&key) {
            debug!(flow = %key, "attaching to pending flow (handler skipped)");
            return self.wait(&key, rx).await;
        }

        let (tx, _rx) = watch::channel(None);
        self.flows.insert(
            key.clone(),
            FlowEntry {
                status: FlowStatus::Pending,
                metadata: None,
                tx,
            },
        );

        match tokio::time::timeout(self.timeout, handler()).await {
            Ok(Ok(value)) => {
                self.resolve(&key, Ok(value.clone()));
                Ok(value)
            }
            Ok(Err(error)) => {
                let message = error.to_string();
                self.resolve(&key, Err(message));
                Err(error)
            }
            Err(_) => {
                self.resolve(&key, Err("handler timed out".to_string()));
                Err(anyhow!(
                    "flow '{key}' handler timed out after {:?}",
                    self.timeout
                ))
            }
        }
    }

    async fn get_flow_state(&self, id: &str, kind: &str) -> anyhow::Result<Option<FlowState>> {
        Ok(self.flows.get(&Self::key(id, kind)).map(|entry| FlowState {
            status: entry.status,
            metadata: entry.metadata.clone(),
        }))
    }

    async fn complete_flow(&self, id: &str, kind: &str, result: Value) -> anyhow::Result<()> {
        self.resolve(&Self::key(id, kind), Ok(result));
        Ok(())
    }

    async fn fail_flow(&self, id: &str, kind: &str, error: &str) -> anyhow::Result<()> {
        self.resolve(&Self::key(id, kind), Err(error.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_flow_resolved_externally() {
        let store = Arc::new(InMemoryFlowStore::new());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.create_flow("u1:gh", "mcp_oauth", None).await })
        };

        // Give the waiter a moment to register the flow.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store
                .get_flow_state("u1:gh", "mcp_oauth")
                .await
                .unwrap()
                .unwrap()
                .status,
            FlowStatus::Pending
        );

        store
            .complete_flow("u1:gh", "mcp_oauth", json!({"access_token": "t"}))
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result["access_token"], "t");
        assert!(store
            .get_flow_state("u1:gh", "mcp_oauth")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fail_flow_propagates() {
        let store = Arc::new(InMemoryFlowStore::new());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.create_flow("u1:gh", "mcp_oauth", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .fail_flow("u1:gh", "mcp_oauth", "user denied")
            .await
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("user denied"));
    }

    #[tokio::test]
    async fn test_handler_runs_once_for_concurrent_callers() {
        let store = Arc::new(InMemoryFlowStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn_caller = |store: Arc<InMemoryFlowStore>, calls: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                store
                    .create_flow_with_handler(
                        "u1:gh",
                        "mcp_get_tokens",
                        Box::new(move || {
                            Box::pin(async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Ok(json!({"token": "shared"}))
                            })
                        }),
                    )
                    .await
            })
        };

        let a = spawn_caller(store.clone(), calls.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = spawn_caller(store.clone(), calls.clone());

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert_eq!(ra, rb);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flow_times_out() {
        let store = InMemoryFlowStore::with_timeout(Duration::from_millis(50));
        let err = store
            .create_flow("u1:gh", "mcp_oauth", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        // The timed-out flow is gone; a new one can start.
        assert!(store
            .get_flow_state("u1:gh", "mcp_oauth")
            .await
            .unwrap()
            .is_none());
    }
}
