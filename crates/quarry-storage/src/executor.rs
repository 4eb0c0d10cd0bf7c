//! Transactional execution of command batches.
//!
//! [`BatchExecutor`] runs every batch of one save inside a single
//! transaction. The transaction is held by a [`TransactionScope`] guard: it
//! commits only when told to, and rolls back on drop otherwise. That covers
//! early returns on error as well as a dropped future when an async save is
//! cancelled. A connection the executor had to open is closed again by the
//! same guard; a connection that was already open is left open.

use tokio_util::sync::CancellationToken;

use crate::batch::{CommandBatch, ModificationCommand};
use crate::connection::RelationalConnection;
use crate::error::StorageError;
use crate::logging::log_command;
use crate::options::StoreOptions;

/// Guard owning an open transaction on a borrowed connection.
pub struct TransactionScope<'c> {
    connection: &'c mut dyn RelationalConnection,
    committed: bool,
    close_on_drop: bool,
}

impl<'c> TransactionScope<'c> {
    /// Begins a transaction on an already-open connection.
    pub fn begin(
        connection: &'c mut dyn RelationalConnection,
        close_on_drop: bool,
    ) -> Result<Self, StorageError> {
        if let Err(e) = connection.begin_transaction() {
            if close_on_drop {
                connection.close();
            }
            return Err(e);
        }
        Ok(TransactionScope {
            connection,
            committed: false,
            close_on_drop,
        })
    }

    pub fn connection(&mut self) -> &mut dyn RelationalConnection {
        &mut *self.connection
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.connection.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.connection.rollback() {
                tracing::warn!(database = %self.connection.database(), error = %e, "rollback failed");
            }
        }
        if self.close_on_drop {
            self.connection.close();
        }
    }
}

/// Runs prepared batches against a connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchExecutor;

impl BatchExecutor {
    /// Executes all batches in one transaction and returns the total number
    /// of affected rows.
    pub fn execute(
        &self,
        batches: &[CommandBatch],
        connection: &mut dyn RelationalConnection,
        options: &StoreOptions,
    ) -> Result<usize, StorageError> {
        let opened = !connection.is_open();
        if opened {
            connection.open()?;
        }
        let mut scope = TransactionScope::begin(connection, opened)?;

        let mut total = 0;
        for (index, batch) in batches.iter().enumerate() {
            tracing::debug!(batch = index, commands = batch.len(), "executing batch");
            for command in &batch.commands {
                let (sql, parameters) = command.sql();
                let database = scope.connection().database().to_string();
                log_command(&database, &sql, &parameters, options.sensitive_data_logging);
                let affected = scope.connection().execute(&sql, &parameters)?;
                total += check_affected(command, affected)?;
            }
        }

        scope.commit()?;
        Ok(total)
    }

    /// Async twin of [`BatchExecutor::execute`]. Checks `cancellation` before
    /// every command and yields between batches.
    pub async fn execute_async(
        &self,
        batches: &[CommandBatch],
        connection: &mut dyn RelationalConnection,
        options: &StoreOptions,
        cancellation: &CancellationToken,
    ) -> Result<usize, StorageError> {
        if cancellation.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let opened = !connection.is_open();
        if opened {
            connection.open_async().await?;
        }
        let mut scope = TransactionScope::begin(connection, opened)?;

        let mut total = 0;
        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }
            tracing::debug!(batch = index, commands = batch.len(), "executing batch");
            for command in &batch.commands {
                if cancellation.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let (sql, parameters) = command.sql();
                let database = scope.connection().database().to_string();
                log_command(&database, &sql, &parameters, options.sensitive_data_logging);
                let affected = scope.connection().execute_async(&sql, &parameters).await?;
                total += check_affected(command, affected)?;
            }
        }

        if cancellation.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        scope.commit()?;
        Ok(total)
    }
}

/// Updates and deletes must hit exactly the row they identify.
fn check_affected(command: &ModificationCommand, affected: usize) -> Result<usize, StorageError> {
    if command.requires_existing_row() && affected == 0 {
        return Err(StorageError::ConcurrencyConflict {
            operation: format!("{:?}", command.state).to_lowercase(),
            table: command.table.clone(),
            affected,
        });
    }
    Ok(affected)
}
