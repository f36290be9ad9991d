//! # mcpool Client Library
//!
//! Pooled, reusable connections to MCP servers on behalf of many
//! concurrent users and conversation threads.
//!
//! ## Modules
//!
//! - `rpc` - Correlated JSON-RPC client over a transport frame channel
//! - `transport` - The four transport adapters and their factory
//! - `session` - Streaming-HTTP session tracking and classification
//! - `connection` - Per-(scope, server) connection state machine
//! - `oauth` - Authorization coordinator (single-flight per principal+server)
//! - `pool` - The scope pool facade: dispatch, activity, reclamation

pub mod connection;
pub mod oauth;
pub mod pool;
pub mod rpc;
pub mod session;
pub mod transport;

pub use connection::{Connection, ReconnectPolicy, ToolInfo};
pub use oauth::{flow_id, OAuthCoordinator, OAuthStartHook};
pub use pool::{
    destroy_instance, get_instance, initialize_mcp, ManifestTool, McpManager, McpManagerBuilder,
    MCP_DELIMITER,
};
pub use session::{classify_session_error, is_valid_session_id, SessionRecord};
pub use transport::{
    DefaultTransportFactory, SessionTermination, Transport, TransportContext, TransportEvent,
    TransportFactory,
};
