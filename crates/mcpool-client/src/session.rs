//! Streaming-HTTP session tracking.
//!
//! The wrapped transport does not surface HTTP status codes, so session
//! errors are classified by substring match over the error rendering. This
//! mirrors the upstream behavior; a richer transport would inspect the
//! status directly.

use chrono::{DateTime, Utc};
use mcpool_core::SessionErrorKind;

/// Per-connection record of a remote-issued opaque session id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub terminated: bool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            terminated: false,
        }
    }
}

/// Session ids are restricted to printable ASCII (0x21-0x7E). Anything else
/// is ignored, treating the server as stateless.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| (0x21..=0x7E).contains(&b))
}

const TERMINATED_MARKERS: [&str; 4] = ["404", "not found", "session not found", "session terminated"];
const INVALID_MARKERS: [&str; 4] = ["400", "bad request", "invalid session", "session invalid"];
const EXPIRED_MARKERS: [&str; 3] = ["timeout", "expired", "session expired"];

/// Classify an error rendering as a session error, if it is one.
pub fn classify_session_error(error: &str) -> Option<SessionErrorKind> {
    let lower = error.to_lowercase();
    let contains = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains(&TERMINATED_MARKERS) {
        Some(SessionErrorKind::Terminated)
    } else if contains(&INVALID_MARKERS) {
        Some(SessionErrorKind::Invalid)
    } else if contains(&EXPIRED_MARKERS) {
        Some(SessionErrorKind::Expired)
    } else {
        None
    }
}
