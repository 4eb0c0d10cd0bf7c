//! Fault-injection tests for database creation with retry.
//!
//! A [`FlakyConnection`] fails `open` a configured number of times with a
//! configured error before succeeding. The sync and async creators must make
//! the same number of attempts and reach the same outcome for the same fault
//! sequence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::{EntityTypeDef, Model, Property, Value, ValueType};
use quarry_storage::{
    ConnectionErrorKind, RelationalConnection, RelationalStore, RetryConfig, RowVisitor, StorageError,
    StoreCreator, StoreOptions,
};

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    statements: AtomicUsize,
}

struct FlakyConnection {
    counters: Arc<Counters>,
    failures: usize,
    kind: ConnectionErrorKind,
    open: bool,
}

impl FlakyConnection {
    fn new(failures: usize, kind: ConnectionErrorKind) -> Self {
        FlakyConnection {
            counters: Arc::new(Counters::default()),
            failures,
            kind,
            open: false,
        }
    }

    fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalConnection for FlakyConnection {
    fn database(&self) -> &str {
        "flaky"
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), StorageError> {
        let attempt = self.counters.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(StorageError::Connection {
                database: "flaky".to_string(),
                kind: self.kind,
                message: format!("attempt {attempt} refused"),
            });
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
    }

    fn begin_transaction(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn execute(&mut self, _sql: &str, _parameters: &[Value]) -> Result<usize, StorageError> {
        self.counters.statements.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn query(&mut self, _sql: &str, _parameters: &[Value], _visit: &mut RowVisitor<'_>) -> Result<(), StorageError> {
        Ok(())
    }

    fn exists(&mut self) -> Result<bool, StorageError> {
        Ok(true)
    }

    fn has_tables(&mut self) -> Result<bool, StorageError> {
        Ok(false)
    }

    fn create_database(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn delete_database(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn creator(max_attempts: u32) -> StoreCreator {
    StoreCreator::new(RetryConfig::immediate(max_attempts))
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn recovers_after_four_transient_failures() {
    let mut connection = FlakyConnection::new(4, ConnectionErrorKind::ServerUnavailable);
    let created = creator(10).create(&mut connection).expect("fifth attempt succeeds");
    assert!(!created);
    assert_eq!(connection.opens(), 5);
    assert!(connection.is_open());
}

#[tokio::test]
async fn recovers_after_four_transient_failures_async() {
    let mut connection = FlakyConnection::new(4, ConnectionErrorKind::ServerUnavailable);
    let created = creator(10)
        .create_async(&mut connection)
        .await
        .expect("fifth attempt succeeds");
    assert!(!created);
    assert_eq!(connection.opens(), 5);
    assert!(connection.is_open());
}

// ---------------------------------------------------------------------------
// Budget exhaustion
// ---------------------------------------------------------------------------

fn assert_budget_exhausted(result: Result<bool, StorageError>, attempts: u32) {
    match result {
        Err(StorageError::RetryLimitExceeded { attempts: made, source }) => {
            assert_eq!(made, attempts);
            assert!(source.is_transient(), "last error is kept: {source}");
        }
        other => panic!("expected RetryLimitExceeded, got {other:?}"),
    }
}

#[test]
fn persistent_transient_failure_exhausts_budget() {
    let mut connection = FlakyConnection::new(usize::MAX, ConnectionErrorKind::Timeout);
    let result = creator(3).create(&mut connection);
    assert_budget_exhausted(result, 3);
    assert_eq!(connection.opens(), 3);
    assert!(!connection.is_open());
}

#[tokio::test]
async fn persistent_transient_failure_exhausts_budget_async() {
    let mut connection = FlakyConnection::new(usize::MAX, ConnectionErrorKind::Timeout);
    let result = creator(3).create_async(&mut connection).await;
    assert_budget_exhausted(result, 3);
    assert_eq!(connection.opens(), 3);
    assert!(!connection.is_open());
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

#[test]
fn fatal_error_is_not_retried() {
    let mut connection = FlakyConnection::new(1, ConnectionErrorKind::Authentication);
    let err = creator(10).create(&mut connection).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Connection {
            kind: ConnectionErrorKind::Authentication,
            ..
        }
    ));
    assert_eq!(connection.opens(), 1);
}

#[tokio::test]
async fn fatal_error_is_not_retried_async() {
    let mut connection = FlakyConnection::new(1, ConnectionErrorKind::Authentication);
    let err = creator(10).create_async(&mut connection).await.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(connection.opens(), 1);
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn async_backoff_doubles_up_to_the_cap() {
    let retry = RetryConfig {
        max_attempts: 10,
        base_delay_ms: 100,
        max_delay_ms: 500,
    };
    let mut connection = FlakyConnection::new(4, ConnectionErrorKind::DatabaseUnavailable);
    let started = tokio::time::Instant::now();
    StoreCreator::new(retry)
        .create_async(&mut connection)
        .await
        .expect("fifth attempt succeeds");
    // 100 + 200 + 400 + 500
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1300), "{elapsed:?}");
}

// ---------------------------------------------------------------------------
// Through the store
// ---------------------------------------------------------------------------

fn blog_model() -> Arc<Model> {
    let mut model = Model::new();
    model
        .add_entity_type(
            EntityTypeDef::new("Blog")
                .property(Property::new("Id", ValueType::Integer))
                .key(&["Id"]),
        )
        .unwrap();
    Arc::new(model)
}

#[test]
fn store_ensure_created_retries_then_creates_tables() {
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    let store = RelationalStore::new(
        "flaky",
        blog_model(),
        StoreOptions::default().with_retry(RetryConfig::immediate(10)),
        move || FlakyConnection {
            counters: Arc::clone(&shared),
            failures: 2,
            kind: ConnectionErrorKind::ServerUnavailable,
            open: false,
        },
    );

    assert!(store.ensure_created().expect("third attempt succeeds"));
    assert_eq!(counters.opens.load(Ordering::SeqCst), 3);
    assert_eq!(counters.statements.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}
