//! Compilation counting through a [`DataStore`] that wraps the in-memory
//! backend and counts calls to `compile_query`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use async_trait::async_trait;
use quarry_core::entity::values;
use quarry_core::{
    CompareOp, Entity, EntityTypeDef, EntityTypeId, Expr, Model, PendingEntry, Property, QueryModel, Value,
    ValueType,
};
use quarry_storage::{
    CompiledQueryCache, DataStore, InMemoryStore, MemoryQuery, QueryContext, StorageError, StoreOptions,
};
use tokio_util::sync::CancellationToken;

struct CountingStore {
    inner: InMemoryStore,
    compilations: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl DataStore for CountingStore {
    type Compiled = MemoryQuery;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &Model {
        self.inner.model()
    }

    fn options(&self) -> &StoreOptions {
        self.inner.options()
    }

    fn compiled_query_cache(&self) -> &CompiledQueryCache<Arc<MemoryQuery>> {
        self.inner.compiled_query_cache()
    }

    fn compile_query(&self, query: &QueryModel) -> Result<MemoryQuery, StorageError> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.compile_query(query)
    }

    fn execute_query(
        &self,
        compiled: &MemoryQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.inner.execute_query(compiled, context)
    }

    async fn execute_query_async(
        &self,
        compiled: &MemoryQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.inner.execute_query_async(compiled, context).await
    }

    fn save_entries(&self, entries: &[PendingEntry]) -> Result<usize, StorageError> {
        self.inner.save_entries(entries)
    }

    async fn save_entries_async(
        &self,
        entries: &[PendingEntry],
        cancellation: &CancellationToken,
    ) -> Result<usize, StorageError> {
        self.inner.save_entries_async(entries, cancellation).await
    }
}

const BLOG: EntityTypeId = EntityTypeId(0);

fn store(delay: Duration) -> CountingStore {
    let mut model = Model::new();
    model
        .add_entity_type(
            EntityTypeDef::new("Blog")
                .property(Property::new("Id", ValueType::Integer))
                .property(Property::new("Rating", ValueType::Integer))
                .key(&["Id"]),
        )
        .unwrap();
    let inner = InMemoryStore::new("blogs", Arc::new(model), StoreOptions::default());
    let entries: Vec<PendingEntry> = (1..=5)
        .map(|id| {
            PendingEntry::added(
                BLOG,
                values([("Id", Value::Integer(id)), ("Rating", Value::Integer(id * 10))]),
            )
        })
        .collect();
    inner.save_changes(&entries).unwrap();
    CountingStore {
        inner,
        compilations: AtomicUsize::new(0),
        delay,
    }
}

fn rated_at_least(minimum: i64) -> QueryModel {
    let query = QueryModel::entities(BLOG);
    let source = query.root_source();
    query
        .filter(Expr::compare(
            CompareOp::Ge,
            Expr::property(source, "Rating"),
            Expr::parameter("minimum"),
        ))
        .with_parameter("minimum", minimum)
}

fn count<S: DataStore>(store: &S, query: &QueryModel) -> usize {
    store.query::<Entity>(query).unwrap().count()
}

#[test]
fn different_parameters_share_one_compilation() {
    let store = store(Duration::ZERO);
    assert_eq!(count(&store, &rated_at_least(10)), 5);
    assert_eq!(count(&store, &rated_at_least(40)), 2);
    assert_eq!(count(&store, &rated_at_least(60)), 0);
    assert_eq!(store.compilations.load(Ordering::SeqCst), 1);
}

#[test]
fn different_shapes_compile_separately() {
    let store = store(Duration::ZERO);
    count(&store, &rated_at_least(10));
    count(&store, &rated_at_least(10).take(2));
    count(&store, &QueryModel::entities(BLOG));
    assert_eq!(store.compilations.load(Ordering::SeqCst), 3);
    assert_eq!(store.compiled_query_cache().len(), 3);
}

#[test]
fn concurrent_first_use_compiles_once() {
    const THREADS: usize = 8;
    let store = store(Duration::from_millis(20));
    let barrier = Barrier::new(THREADS);

    let compiled: Vec<Arc<MemoryQuery>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS as i64)
            .map(|i| {
                let store = &store;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    store.compiled_query(&rated_at_least(i)).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(store.compilations.load(Ordering::SeqCst), 1);
    assert!(compiled.iter().all(|c| Arc::ptr_eq(c, &compiled[0])));
}

#[test]
fn failed_compilation_is_not_cached() {
    let store = store(Duration::ZERO);
    let query = QueryModel::entities(BLOG);
    let source = query.root_source();
    let broken = query.filter(Expr::equals(Expr::property(source, "Missing"), Expr::constant(1i64)));

    assert!(store.query::<Entity>(&broken).is_err());
    assert!(store.query::<Entity>(&broken).is_err());
    assert_eq!(store.compilations.load(Ordering::SeqCst), 2);
    assert!(store.compiled_query_cache().is_empty());
}

#[tokio::test]
async fn async_queries_use_the_same_cache() {
    use futures::StreamExt;

    let store = store(Duration::ZERO);
    assert_eq!(count(&store, &rated_at_least(30)), 3);
    let streamed = store
        .query_async::<Entity>(&rated_at_least(50), CancellationToken::new())
        .await
        .unwrap()
        .count()
        .await;
    assert_eq!(streamed, 1);
    assert_eq!(store.compilations.load(Ordering::SeqCst), 1);
}
