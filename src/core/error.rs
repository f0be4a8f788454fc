//! Error types for the connection management layer
//!
//! Every failure surfaced by this crate is a [`DatabaseError`]. Backend faults are
//! classified by the [`Dialect`](super::dialect::Dialect) adapter at the point where the
//! driver error is converted, so "was this a duplicate key" is a pattern match rather
//! than an error-code lookup at every call site.

use std::fmt;

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Why a lease could not be handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// The bounded wait elapsed before a connection became available
    Timeout {
        /// How long the caller waited
        waited_ms: u64,
    },
    /// The pool is closing and rejects new acquisitions
    Draining,
    /// The pool has not been initialized yet
    NotInitialized,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyReason::Timeout { waited_ms } => {
                write!(f, "no connection available after {}ms", waited_ms)
            }
            BusyReason::Draining => f.write_str("pool is draining"),
            BusyReason::NotInitialized => f.write_str("pool is not initialized"),
        }
    }
}

/// Coarse category of a [`DatabaseError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeout, draining or not-yet-initialized pool
    Busy,
    /// Unique/primary key violation reported by the backend
    ConstraintViolation,
    /// Deadlock or lock-wait failure reported by the backend
    Deadlock,
    /// Any other backend failure
    BackendFault,
    /// Operation attempted outside the required lifecycle state
    State,
    /// API misuse by the caller
    Usage,
}

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// No lease could be handed out; always retryable by the caller
    #[error("Database busy: {reason}")]
    Busy { reason: BusyReason },

    /// Unique or primary key constraint violated
    #[error("Constraint violation (code {code}): {message}")]
    ConstraintViolation { code: i64, message: String },

    /// Deadlock detected or lock wait expired inside the backend
    #[error("Deadlock (code {code}): {message}")]
    Deadlock { code: i64, message: String },

    /// Unclassified backend failure
    #[error("Backend error{}: {message}", .code.map(|c| format!(" (code {})", c)).unwrap_or_default())]
    Backend { code: Option<i64>, message: String },

    /// Failed to establish a physical connection
    #[error("Connection failed to {target} - {message}")]
    ConnectionFailed { target: String, message: String },

    /// Operation attempted in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    State(String),

    /// Programming error on the caller side
    #[error("Usage error: {0}")]
    Usage(String),

    /// Bounded retry loop gave up
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DatabaseError>,
    },

    /// Column not found in a result row
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Setting value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatabaseError {
    /// Create a busy error
    pub fn busy(reason: BusyReason) -> Self {
        DatabaseError::Busy { reason }
    }

    /// Create a busy error for an elapsed acquisition wait
    pub fn busy_timeout(waited: std::time::Duration) -> Self {
        DatabaseError::Busy {
            reason: BusyReason::Timeout {
                waited_ms: waited.as_millis() as u64,
            },
        }
    }

    /// Create an unclassified backend error
    pub fn backend(code: Option<i64>, message: impl Into<String>) -> Self {
        DatabaseError::Backend {
            code,
            message: message.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(target: impl Into<String>, message: impl Into<String>) -> Self {
        DatabaseError::ConnectionFailed {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a lifecycle state error
    pub fn state<S: Into<String>>(msg: S) -> Self {
        DatabaseError::State(msg.into())
    }

    /// Create a usage error
    pub fn usage<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Usage(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::Busy { .. } => ErrorKind::Busy,
            DatabaseError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            DatabaseError::Deadlock { .. } => ErrorKind::Deadlock,
            DatabaseError::State(_) => ErrorKind::State,
            DatabaseError::Usage(_) => ErrorKind::Usage,
            DatabaseError::RetriesExhausted { .. }
            | DatabaseError::Backend { .. }
            | DatabaseError::ConnectionFailed { .. }
            | DatabaseError::ColumnNotFound(_)
            | DatabaseError::TypeMismatch { .. }
            | DatabaseError::Io(_)
            | DatabaseError::Serialization(_) => ErrorKind::BackendFault,
        }
    }

    /// True when no lease could be handed out
    pub fn is_busy(&self) -> bool {
        matches!(self, DatabaseError::Busy { .. })
    }

    /// True when another writer already inserted the same key
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, DatabaseError::ConstraintViolation { .. })
    }

    /// True for backend-reported deadlocks and lock wait expiry
    pub fn is_deadlock(&self) -> bool {
        matches!(self, DatabaseError::Deadlock { .. })
    }

    /// True when the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DatabaseError::Busy { .. } | DatabaseError::Deadlock { .. }
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let message = message.clone().unwrap_or_else(|| err.to_string());
                super::dialect::Dialect::Sqlite.classify(i64::from(failure.extended_code), message)
            }
            _ => DatabaseError::backend(None, err.to_string()),
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for DatabaseError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => {
                super::dialect::Dialect::Mysql.classify(i64::from(server.code), server.message)
            }
            other => DatabaseError::backend(None, other.to_string()),
        }
    }
}
