//! Connection lifecycle events.
//!
//! Each connection owns a broadcast channel of `ConnectionEvent`. The
//! authorization coordinator posts `OAuthHandled` / `OAuthFailed` back onto
//! this channel rather than calling into the connection, so the connection
//! drives its own state machine from its event inbox.

use serde::{Deserialize, Serialize};

use crate::error::SessionErrorKind;

/// Connection state for the per-(scope, server) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by a connection over its broadcast channel.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChange {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Authorization wall hit during connect; carries context for the
    /// coordinator.
    OAuthRequired {
        server: String,
        principal: String,
        server_url: Option<String>,
        error: String,
    },
    OAuthHandled,
    OAuthFailed {
        error: String,
    },
    SessionCreated {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
    },
    SessionError {
        kind: SessionErrorKind,
    },
    /// Server pushed `notifications/resources/list_changed`.
    ResourcesChanged,
    Error {
        message: String,
    },
}
