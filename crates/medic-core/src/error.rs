//! Error types for Medic Core
//!
//! Two families with very different consequences:
//! - `StoreError`: the retry state store could not be read or written. The
//!   loop cannot make a correct decision without it, so it is fatal.
//! - `PortError`: an external collaborator failed. Never fatal; the loop
//!   degrades it to "wait" or "escalate".

use std::path::PathBuf;

/// Retry state store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database file could not be opened or prepared
    #[error("cannot open retry store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Parent directory of the database file could not be created
    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Any other SQLite failure
    #[error("retry store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Row could not be decoded into a record
    #[error("corrupt row in retry store: {0}")]
    CorruptRow(String),
}

impl StoreError {
    /// Create open error for path
    pub fn open(path: impl Into<PathBuf>, source: rusqlite::Error) -> Self {
        Self::Open {
            path: path.into(),
            source,
        }
    }
}

/// External collaborator failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Network or transport level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Call exceeded the configured bound
    #[error("{what} timed out after {secs}s")]
    Timeout { what: &'static str, secs: u64 },

    /// Response arrived but could not be understood
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Remote side answered with a non-success status
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Required secret is not configured
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

impl PortError {
    /// Transport hiccups and timeouts may go away by themselves
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}
