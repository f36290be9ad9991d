//! Server descriptors - the per-server registry entries.
//!
//! A `ServerConfig` is immutable once registered with the pool. Transport
//! fields live at the top level (command/args/env for stdio, url/headers for
//! the HTTP family) following the standard MCP config format used by
//! VS Code, Cursor, and Claude Desktop.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::McpError;

/// Sentinel principal used for process-scope connections.
pub const SYSTEM_PRINCIPAL: &str = "system";

/// Default handshake timeout when a descriptor does not override it.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Handshake timeout the pool applies when establishing scoped connections.
pub const POOL_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-call timeout for `tools/call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Placeholder expanded to the calling principal's id.
pub const USER_ID_PLACEHOLDER: &str = "{{USER_ID}}";

/// Transport kind for a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    Websocket,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Websocket => "websocket",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth configuration for servers that require interactive authorization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub issuer_url: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Declaration of a per-user variable the embedding app collects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserVarSpec {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Whether to surface server-supplied instructions, or a fixed override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerInstructions {
    Enabled(bool),
    Custom(String),
}

/// A single server entry in the configuration table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Declared transport type. Optional: the selection rule below can
    /// usually infer it from the transport fields.
    #[serde(default, rename = "type")]
    pub kind: Option<TransportKind>,

    // --- stdio transport ---
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // --- sse / websocket / streamable-http transports ---
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Handshake timeout in milliseconds (default 120000).
    pub init_timeout: Option<u64>,
    /// Per tool-call timeout in milliseconds (default 60000).
    pub timeout: Option<u64>,

    pub icon_path: Option<String>,
    pub server_instructions: Option<ServerInstructions>,
    #[serde(default)]
    pub custom_user_vars: HashMap<String, UserVarSpec>,
    pub oauth: Option<OAuthConfig>,
}

impl ServerConfig {
    /// Resolve the transport kind for this descriptor.
    ///
    /// Selection rule: a command field means stdio; a `ws://`/`wss://` url
    /// means websocket; a declared `streamable-http` type is honored;
    /// any other url means SSE.
    pub fn transport_kind(&self, server: &str) -> Result<TransportKind, McpError> {
        if self.command.is_some() {
            return Ok(TransportKind::Stdio);
        }

        let url = self.url.as_deref().ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "descriptor has neither a command nor a url".to_string(),
        })?;

        let parsed = url::Url::parse(url).map_err(|e| McpError::Configuration {
            server: server.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;

        if matches!(parsed.scheme(), "ws" | "wss") {
            return Ok(TransportKind::Websocket);
        }
        if self.kind == Some(TransportKind::StreamableHttp) {
            return Ok(TransportKind::StreamableHttp);
        }
        Ok(TransportKind::Sse)
    }

    /// Handshake timeout, falling back to the 120 s default.
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INIT_TIMEOUT)
    }

    /// Per tool-call timeout, falling back to the 60 s default.
    pub fn call_timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    /// Whether server-supplied instructions should be surfaced.
    pub fn wants_instructions(&self) -> bool {
        !matches!(
            self.server_instructions,
            None | Some(ServerInstructions::Enabled(false))
        )
    }

    /// Substitute `{{USER_ID}}` and declared `{{VAR}}` placeholders in url,
    /// headers, env, and args, producing the descriptor actually used for a
    /// scoped connection.
    pub fn resolve_user_vars(
        &self,
        principal: &str,
        user_vars: &HashMap<String, String>,
    ) -> ServerConfig {
        let sub = |s: &str| substitute_placeholders(s, principal, user_vars);

        let mut resolved = self.clone();
        resolved.url = self.url.as_deref().map(sub);
        resolved.command = self.command.as_deref().map(sub);
        resolved.args = self.args.iter().map(|a| sub(a)).collect();
        resolved.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), sub(v)))
            .collect();
        resolved.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), sub(v)))
            .collect();
        resolved
    }
}

fn substitute_placeholders(
    input: &str,
    principal: &str,
    user_vars: &HashMap<String, String>,
) -> String {
    let mut out = input.replace(USER_ID_PLACEHOLDER, principal);
    for (name, value) in user_vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}
