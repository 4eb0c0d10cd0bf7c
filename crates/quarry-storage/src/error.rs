//! Storage error types for quarry-storage.
//!
//! [`StorageError`] covers every failure mode of the data-access layer and
//! classifies itself along the lines callers act on:
//!
//! - transient infrastructure errors ([`StorageError::is_transient`]) are
//!   retried by the store creator;
//! - [`StorageError::UnableToDiscriminate`] is a data-integrity fault and is
//!   never retried;
//! - [`StorageError::Cancelled`] is distinct from every failure;
//! - [`StorageError::InvalidArgument`] is raised before any I/O.

use std::fmt;

use quarry_core::CoreError;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Classification of a failure to reach or open a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Nothing is listening at the target yet.
    ServerUnavailable,
    /// The attempt timed out.
    Timeout,
    /// The database exists but cannot be opened yet (mid-creation).
    DatabaseUnavailable,
    /// Credentials were rejected.
    Authentication,
    /// Anything else.
    Other,
}

impl ConnectionErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionErrorKind::ServerUnavailable
                | ConnectionErrorKind::Timeout
                | ConnectionErrorKind::DatabaseUnavailable
        )
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionErrorKind::ServerUnavailable => "server unavailable",
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::DatabaseUnavailable => "database unavailable",
            ConnectionErrorKind::Authentication => "authentication failed",
            ConnectionErrorKind::Other => "connection failed",
        };
        f.write_str(name)
    }
}

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Model or result-shape error from quarry-core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Opening or probing a connection failed.
    #[error("{kind} while connecting to '{database}': {message}")]
    Connection {
        database: String,
        kind: ConnectionErrorKind,
        message: String,
    },

    /// An operation required an open connection.
    #[error("connection to '{database}' is not open")]
    ConnectionClosed { database: String },

    /// A stored discriminator value matched no concrete type of the hierarchy.
    #[error("unable to materialize entity of type '{entity_type}': discriminator value {value} matches no known subtype")]
    UnableToDiscriminate { entity_type: String, value: String },

    /// A required argument was missing or malformed.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// The caller cancelled the operation.
    #[error("operation was cancelled")]
    Cancelled,

    /// An update or delete did not affect exactly one row.
    #[error("concurrency conflict: {operation} on '{table}' expected 1 row, affected {affected}")]
    ConcurrencyConflict {
        operation: String,
        table: String,
        affected: usize,
    },

    /// An insert collided with an existing key.
    #[error("duplicate key {key} in table '{table}'")]
    DuplicateKey { table: String, key: String },

    /// Pending changes reference each other in a cycle.
    #[error("circular dependency between pending changes: {reason}")]
    CircularDependency { reason: String },

    /// A query model could not be translated for this backend.
    #[error("query translation failed: {reason}")]
    Translation { reason: String },

    /// A transient error persisted past the retry budget.
    #[error("gave up after {attempts} attempt(s): {source}")]
    RetryLimitExceeded {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Returns `true` for infrastructure failures expected to clear up on
    /// their own.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Connection { kind, .. } => kind.is_transient(),
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }

    pub(crate) fn invalid_argument(name: &str, reason: impl Into<String>) -> Self {
        StorageError::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn translation(reason: impl Into<String>) -> Self {
        StorageError::Translation {
            reason: reason.into(),
        }
    }
}
