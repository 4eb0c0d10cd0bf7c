//! Resilient database creation.
//!
//! [`StoreCreator`] makes sure the database behind a [`RelationalConnection`]
//! exists and accepts connections, tolerating transient failures while the
//! server or the database is still coming up.
//!
//! The retry policy lives in one state machine, [`RetryState`]:
//!
//! ```text
//! Idle -> Probing -> Ready
//!            |  \--> Failed
//!            v
//!         Retrying -> Probing
//! ```
//!
//! Every probe result is fed to [`RetryState::next`], which answers with
//! the next [`RetryStep`]. The sync and async entry points only differ in how
//! they run a probe and how they wait (`thread::sleep` vs.
//! `tokio::time::sleep`), so they retry identically for the same sequence of
//! errors. The connection is closed before every wait.

use std::time::Duration;

use quarry_core::{EntityTypeId, Model};

use crate::connection::RelationalConnection;
use crate::error::StorageError;
use crate::logging::log_command;
use crate::options::RetryConfig;
use crate::sql::generate_create_table;

/// Where a creation attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorState {
    Idle,
    Probing { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Ready,
    Failed,
}

/// What the driver should do next.
#[derive(Debug)]
pub enum RetryStep<T> {
    Done(T),
    Wait(Duration),
    Fail(StorageError),
}

/// Attempt counter and backoff policy of one creation call.
#[derive(Debug)]
pub struct RetryState {
    config: RetryConfig,
    state: CreatorState,
    attempts: u32,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        RetryState {
            config,
            state: CreatorState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> CreatorState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Enters `Probing` for the next attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.state = CreatorState::Probing {
            attempt: self.attempts,
        };
    }

    /// Classifies the result of the current probe.
    pub fn next<T>(&mut self, result: Result<T, StorageError>) -> RetryStep<T> {
        match result {
            Ok(value) => {
                self.state = CreatorState::Ready;
                RetryStep::Done(value)
            }
            Err(error) if !error.is_transient() => {
                self.state = CreatorState::Failed;
                RetryStep::Fail(error)
            }
            Err(error) if self.attempts >= self.config.max_attempts.max(1) => {
                self.state = CreatorState::Failed;
                RetryStep::Fail(StorageError::RetryLimitExceeded {
                    attempts: self.attempts,
                    source: Box::new(error),
                })
            }
            Err(error) => {
                let delay = self.config.backoff_delay(self.attempts - 1);
                tracing::warn!(
                    attempt = self.attempts,
                    max_attempts = self.config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient error while creating store, retrying"
                );
                self.state = CreatorState::Retrying {
                    attempt: self.attempts,
                    delay,
                };
                RetryStep::Wait(delay)
            }
        }
    }
}

/// Creates databases and their tables.
#[derive(Debug, Clone)]
pub struct StoreCreator {
    retry: RetryConfig,
    sensitive_data_logging: bool,
}

impl StoreCreator {
    pub fn new(retry: RetryConfig) -> Self {
        StoreCreator {
            retry,
            sensitive_data_logging: false,
        }
    }

    pub fn with_sensitive_data_logging(mut self, enabled: bool) -> Self {
        self.sensitive_data_logging = enabled;
        self
    }

    /// One probe: create the database if missing, then open a connection to
    /// prove it is usable.
    fn probe(connection: &mut dyn RelationalConnection, created: &mut bool) -> Result<(), StorageError> {
        if !connection.exists()? {
            connection.create_database()?;
            *created = true;
        }
        connection.open()
    }

    async fn probe_async(connection: &mut dyn RelationalConnection, created: &mut bool) -> Result<(), StorageError> {
        if !connection.exists()? {
            connection.create_database()?;
            *created = true;
        }
        connection.open_async().await
    }

    /// Ensures the database exists and accepts connections, retrying
    /// transient errors. Returns `true` if the database was created. The
    /// connection is left open on success.
    pub fn create(&self, connection: &mut dyn RelationalConnection) -> Result<bool, StorageError> {
        let mut retry = RetryState::new(self.retry.clone());
        let mut created = false;
        loop {
            retry.begin_attempt();
            let result = Self::probe(connection, &mut created);
            match retry.next(result) {
                RetryStep::Done(_) => return Ok(created),
                RetryStep::Wait(delay) => {
                    connection.close();
                    std::thread::sleep(delay);
                }
                RetryStep::Fail(error) => {
                    connection.close();
                    return Err(error);
                }
            }
        }
    }

    /// Async twin of [`StoreCreator::create`].
    pub async fn create_async(&self, connection: &mut dyn RelationalConnection) -> Result<bool, StorageError> {
        let mut retry = RetryState::new(self.retry.clone());
        let mut created = false;
        loop {
            retry.begin_attempt();
            let result = Self::probe_async(connection, &mut created).await;
            match retry.next(result) {
                RetryStep::Done(_) => return Ok(created),
                RetryStep::Wait(delay) => {
                    connection.close();
                    tokio::time::sleep(delay).await;
                }
                RetryStep::Fail(error) => {
                    connection.close();
                    return Err(error);
                }
            }
        }
    }

    /// Creates the database if needed, then one table per hierarchy root if
    /// the database has none. Returns `true` if anything was created. The
    /// connection is closed afterwards.
    pub fn ensure_created(
        &self,
        connection: &mut dyn RelationalConnection,
        model: &Model,
    ) -> Result<bool, StorageError> {
        let created = self.create(connection)?;
        let result = self.create_tables(connection, model, created);
        connection.close();
        result
    }

    pub async fn ensure_created_async(
        &self,
        connection: &mut dyn RelationalConnection,
        model: &Model,
    ) -> Result<bool, StorageError> {
        let created = self.create_async(connection).await?;
        let result = self.create_tables(connection, model, created);
        connection.close();
        result
    }

    fn create_tables(
        &self,
        connection: &mut dyn RelationalConnection,
        model: &Model,
        database_created: bool,
    ) -> Result<bool, StorageError> {
        if !database_created && connection.has_tables()? {
            return Ok(false);
        }
        let roots: Vec<EntityTypeId> = model.root_types().map(|t| t.id).collect();
        connection.begin_transaction()?;
        for root in roots {
            let ddl = match generate_create_table(model, root) {
                Ok(ddl) => ddl,
                Err(e) => {
                    connection.rollback()?;
                    return Err(e);
                }
            };
            log_command(connection.database(), &ddl, &[], self.sensitive_data_logging);
            if let Err(e) = connection.execute(&ddl, &[]) {
                connection.rollback()?;
                return Err(e);
            }
        }
        connection.commit()?;
        tracing::info!(database = %connection.database(), "created tables");
        Ok(true)
    }

    /// Deletes the database if it exists. Returns `true` if it did.
    pub fn ensure_deleted(&self, connection: &mut dyn RelationalConnection) -> Result<bool, StorageError> {
        if !connection.exists()? {
            return Ok(false);
        }
        connection.close();
        connection.delete_database()?;
        Ok(true)
    }
}
