//! Structured log events shared by the stores.
//!
//! Parameter values only appear in events when sensitive data logging is
//! enabled; otherwise just their count is logged.

use quarry_core::Value;

use crate::error::StorageError;

/// Logs a statement about to run.
pub fn log_command(database: &str, sql: &str, parameters: &[Value], sensitive_data_logging: bool) {
    if sensitive_data_logging {
        tracing::debug!(database, sql, parameters = ?parameters, "executing command");
    } else {
        tracing::debug!(database, sql, parameters = parameters.len(), "executing command");
    }
}

/// Logs a failure escaping a public store operation.
pub fn log_failure(store: &str, operation: &'static str, error: &StorageError) {
    if error.is_cancelled() {
        tracing::debug!(store, operation, "operation cancelled");
    } else {
        tracing::error!(store, operation, error = %error, "data store operation failed");
    }
}

/// Passes `result` through, logging it first if it is an error.
pub fn logged<T>(store: &str, operation: &'static str, result: Result<T, StorageError>) -> Result<T, StorageError> {
    if let Err(error) = &result {
        log_failure(store, operation, error);
    }
    result
}
