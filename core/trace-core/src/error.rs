//! Error types for trace-core operations.
//!
//! Only failures that would otherwise risk silent data loss surface here.
//! Missing parents are never errors (they become orphans), and corrupt
//! records are logged and treated as absent by the loaders.

use std::path::PathBuf;
use std::time::Duration;

/// All errors that can occur in trace-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Write validation failed: {path}: {reason}")]
    InvalidWrite { path: PathBuf, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Coordination Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Timed out after {waited:?} waiting for lock: {scope}")]
    LockTimeout { scope: String, waited: Duration },

    // ─────────────────────────────────────────────────────────────────────
    // Identity Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("No session context available (need a session id or parent + owner label)")]
    NoContext,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Event id {id} is already claimed by session {owner}")]
    IdConflict { id: String, owner: String },

    // ─────────────────────────────────────────────────────────────────────
    // Forest Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Parent link for {id} would create a cycle through {parent}")]
    Cycle { id: String, parent: String },

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cannot end {id} with non-terminal status {status}")]
    NonTerminalStatus { id: String, status: String },
}

/// Convenience type alias for Results using TraceError.
pub type Result<T> = std::result::Result<T, TraceError>;

impl TraceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TraceError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        TraceError::Json {
            context: context.into(),
            source,
        }
    }

    /// True for I/O failures worth retrying on the read path.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            TraceError::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::TimedOut
                    | ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, TraceError::LockTimeout { .. })
    }
}

impl From<TraceError> for String {
    fn from(err: TraceError) -> String {
        err.to_string()
    }
}
