//! Error taxonomy shared across the workspace.
//!
//! Transient transport errors are absorbed by the connection's reconnect
//! loop; only terminal failures surface through these variants. Tool errors
//! are always surfaced. User-visible variants carry the server name (and the
//! principal where known) for diagnosis.

use thiserror::Error;

/// Classification of streaming-HTTP session errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    /// The server no longer knows the session (404-shaped). Recoverable.
    Terminated,
    /// The session aged out (timeout-shaped). Recoverable.
    Expired,
    /// The session id was rejected (400-shaped). Surfaced to the caller.
    Invalid,
}

impl SessionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminated => "session_terminated",
            Self::Expired => "session_expired",
            Self::Invalid => "session_invalid",
        }
    }

    /// Terminated and expired sessions are recovered transparently by the
    /// connection; invalid sessions are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Terminated | Self::Expired)
    }
}

impl std::fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum McpError {
    /// Unknown server, malformed transport options, missing required field.
    /// Fatal to the specific request; never retried.
    #[error("configuration error for '{server}': {reason}")]
    Configuration { server: String, reason: String },

    /// Handshake failure, send failure, or unexpected close. Triggers the
    /// reconnect loop unless shutdown is in progress.
    #[error("transport failure for '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Connection establishment hit an authorization wall; the current
    /// operation is suspended pending the coordinator.
    #[error("authorization required for '{server}' (principal '{principal}')")]
    AuthorizationRequired { server: String, principal: String },

    /// The authorization flow failed or timed out; terminal for the current
    /// connect attempt.
    #[error("authorization failed for '{server}' (principal '{principal}'): {reason}")]
    AuthorizationFailed {
        server: String,
        principal: String,
        reason: String,
    },

    #[error("session error ({kind}) for '{server}'")]
    Session {
        server: String,
        kind: SessionErrorKind,
    },

    #[error("{operation} timed out after {timeout_ms} ms for '{server}'")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Server-returned error in a `tools/call`; surfaced verbatim.
    #[error("tool '{tool}' failed on '{server}': {reason}")]
    Tool {
        server: String,
        tool: String,
        reason: String,
    },

    /// The manager is being torn down; new operations are rejected.
    #[error("manager is shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl McpError {
    pub fn timeout(server: &str, operation: &str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            server: server.to_string(),
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn transport(server: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

/// Check whether an error rendering indicates an authorization failure.
///
/// The wrapped transports stringify HTTP failures, so detection is by
/// message content: a literal `401` (including the SDK's
/// `Non-200 status code (401)` form) or a JSON-RPC error code of 401/403.
pub fn is_authorization_error(message: &str, code: Option<i64>) -> bool {
    if matches!(code, Some(401) | Some(403)) {
        return true;
    }
    message.contains("401") || message.contains("Non-200 status code (401)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_error_detection() {
        assert!(is_authorization_error("HTTP 401 Unauthorized", None));
        assert!(is_authorization_error("Non-200 status code (401)", None));
        assert!(is_authorization_error("anything", Some(401)));
        assert!(is_authorization_error("anything", Some(403)));
        assert!(!is_authorization_error("connection refused", None));
        assert!(!is_authorization_error("HTTP 500", Some(500)));
    }

    #[test]
    fn test_session_kind_recoverability() {
        assert!(SessionErrorKind::Terminated.is_recoverable());
        assert!(SessionErrorKind::Expired.is_recoverable());
        assert!(!SessionErrorKind::Invalid.is_recoverable());
    }

    #[test]
    fn test_error_display_carries_server() {
        let err = McpError::transport("gh", "boom");
        assert!(err.to_string().contains("gh"));

        let err = McpError::timeout("gh", "connect", std::time::Duration::from_secs(30));
        assert!(err.to_string().contains("30000 ms"));
    }
}
