//! The connection abstraction of the relational backend.
//!
//! [`RelationalConnection`] is everything the batch executor, the store
//! creator, and query execution need from a database connection. The
//! asynchronous methods default to their synchronous counterparts, which is
//! what an embedded engine like SQLite wants; networked drivers override
//! them.
//!
//! [`SqliteConnection`] implements it over `rusqlite`. Opening configures the
//! same pragmas for every connection: WAL journaling, `NORMAL` sync, and
//! foreign key enforcement.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use quarry_core::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags};

use crate::error::StorageError;
use crate::value_reader::{to_sql_value, ValueReader};

/// Receives each row of a query.
pub type RowVisitor<'v> = dyn FnMut(&dyn ValueReader) -> Result<(), StorageError> + Send + 'v;

/// A connection to one relational database.
#[async_trait]
pub trait RelationalConnection: Send {
    /// Name of the database, for logs and errors.
    fn database(&self) -> &str;

    fn is_open(&self) -> bool;

    fn open(&mut self) -> Result<(), StorageError>;

    async fn open_async(&mut self) -> Result<(), StorageError> {
        self.open()
    }

    /// Closes the connection. Closing a closed connection does nothing.
    fn close(&mut self);

    fn begin_transaction(&mut self) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;

    /// Runs one statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<usize, StorageError>;

    async fn execute_async(&mut self, sql: &str, parameters: &[Value]) -> Result<usize, StorageError> {
        self.execute(sql, parameters)
    }

    /// Runs a query and passes every row to `visit`, stopping at the first
    /// error either side reports.
    fn query(
        &mut self,
        sql: &str,
        parameters: &[Value],
        visit: &mut RowVisitor<'_>,
    ) -> Result<(), StorageError>;

    async fn query_async(
        &mut self,
        sql: &str,
        parameters: &[Value],
        visit: &mut RowVisitor<'_>,
    ) -> Result<(), StorageError> {
        self.query(sql, parameters, visit)
    }

    /// Returns `true` if the database exists. Does not need an open
    /// connection.
    fn exists(&mut self) -> Result<bool, StorageError>;

    /// Returns `true` if the database holds any user table.
    fn has_tables(&mut self) -> Result<bool, StorageError>;

    fn create_database(&mut self) -> Result<(), StorageError>;

    fn delete_database(&mut self) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// A [`RelationalConnection`] to a SQLite database file.
pub struct SqliteConnection {
    path: PathBuf,
    name: String,
    conn: Option<Connection>,
}

impl SqliteConnection {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        SqliteConnection {
            name: path.display().to_string(),
            path,
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&mut self) -> Result<&mut Connection, StorageError> {
        let name = &self.name;
        self.conn.as_mut().ok_or_else(|| StorageError::ConnectionClosed {
            database: name.clone(),
        })
    }

    fn configure(conn: &Connection) -> Result<(), StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }
}

#[async_trait]
impl RelationalConnection for SqliteConnection {
    fn database(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn open(&mut self) -> Result<(), StorageError> {
        if self.conn.is_some() {
            return Ok(());
        }
        // No CREATE flag: a missing file is reported, not silently created.
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(&conn)?;
        tracing::debug!(database = %self.name, "opened connection");
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) {
        if self.conn.take().is_some() {
            tracing::debug!(database = %self.name, "closed connection");
        }
    }

    fn begin_transaction(&mut self) -> Result<(), StorageError> {
        self.connection()?.execute_batch("BEGIN")?;
        tracing::debug!(database = %self.name, "began transaction");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.connection()?.execute_batch("COMMIT")?;
        tracing::debug!(database = %self.name, "committed transaction");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.connection()?.execute_batch("ROLLBACK")?;
        tracing::debug!(database = %self.name, "rolled back transaction");
        Ok(())
    }

    fn execute(&mut self, sql: &str, parameters: &[Value]) -> Result<usize, StorageError> {
        let conn = self.connection()?;
        let mut statement = conn.prepare_cached(sql)?;
        let affected = statement.execute(params_from_iter(parameters.iter().map(to_sql_value)))?;
        Ok(affected)
    }

    fn query(
        &mut self,
        sql: &str,
        parameters: &[Value],
        visit: &mut RowVisitor<'_>,
    ) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let mut statement = conn.prepare_cached(sql)?;
        let mut rows = statement.query(params_from_iter(parameters.iter().map(to_sql_value)))?;
        while let Some(row) = rows.next()? {
            visit(row)?;
        }
        Ok(())
    }

    fn exists(&mut self) -> Result<bool, StorageError> {
        Ok(self.path.is_file())
    }

    fn has_tables(&mut self) -> Result<bool, StorageError> {
        let count: i64 = self.connection()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_database(&mut self) -> Result<(), StorageError> {
        let conn = Connection::open(&self.path)?;
        Self::configure(&conn)?;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        tracing::info!(database = %self.name, "created database");
        Ok(())
    }

    fn delete_database(&mut self) -> Result<(), StorageError> {
        self.close();
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::Connection {
                        database: self.name.clone(),
                        kind: crate::error::ConnectionErrorKind::Other,
                        message: e.to_string(),
                    })
                }
            }
        }
        tracing::info!(database = %self.name, "deleted database");
        Ok(())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        self.close();
    }
}
