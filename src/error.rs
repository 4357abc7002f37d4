use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unknown table \"{0}\"")]
    UnknownTable(String),

    #[error("Record in table \"{table}\" has no id")]
    MissingId { table: String },

    #[error("Invalid column name \"{0}\"")]
    InvalidColumn(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification of remote store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Transport unreachable (offline, DNS, refused).
    Unreachable,
    /// Operation exceeded its time bound.
    Timeout,
    /// The store refused the operation (permissions, malformed document).
    Rejected,
    /// A batch exceeded the store-imposed operation limit.
    BatchTooLarge,
}

/// Error returned by a [`RemoteStore`](crate::storage::traits::RemoteStore)
/// implementation.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(message, RemoteErrorKind::Unreachable)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message, RemoteErrorKind::Timeout)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(message, RemoteErrorKind::Rejected)
    }

    /// True for failures that mean "offline, retry later".
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Unreachable | RemoteErrorKind::Timeout
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

// ---------------------------------------------------------------------------
// SchemaError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to read local schema: {0}")]
    Local(#[from] StorageError),

    #[error("Failed to write schema descriptor for \"{table}\": {source}")]
    Remote {
        table: String,
        #[source]
        source: RemoteError,
    },
}

// ---------------------------------------------------------------------------
// Concurrency rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("A reconciliation is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("A recovery is already running")]
    AlreadyRunning,
}

// ---------------------------------------------------------------------------
// PosSyncError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PosSyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for PosSyncError {
    fn from(e: rusqlite::Error) -> Self {
        PosSyncError::Storage(StorageError::Sqlite(e))
    }
}

/// Convenience alias — the default error type is `PosSyncError`.
pub type Result<T, E = PosSyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
