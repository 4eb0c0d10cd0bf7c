//! The relational backend.
//!
//! [`RelationalStore`] compiles queries to SQL text once per shape and runs
//! them over a [`RelationalConnection`]. Every call gets its own connection
//! from the store's connector, opens it, and closes it before returning, so
//! no connection outlives the operation that opened it. Saves go through
//! [`CommandBatchPreparer`] and [`BatchExecutor`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{Model, PendingEntry, QueryModel, Value};
use tokio_util::sync::CancellationToken;

use crate::batch::CommandBatchPreparer;
use crate::cache::CompiledQueryCache;
use crate::compile::translate;
use crate::connection::{RelationalConnection, SqliteConnection};
use crate::context::{CompiledQuery, QueryContext, ResultShaper};
use crate::creator::StoreCreator;
use crate::error::StorageError;
use crate::executor::BatchExecutor;
use crate::logging::log_command;
use crate::materializer::MaterializerFactory;
use crate::options::StoreOptions;
use crate::sql::generate_select;
use crate::traits::DataStore;
use crate::value_reader::{read_row, ValueReader};

/// A query compiled to SQL.
#[derive(Debug)]
pub struct RelationalQuery {
    pub sql: String,
    /// Parameter names in `?N` order.
    pub parameter_names: Vec<String>,
    shaper: ResultShaper,
}

impl CompiledQuery for RelationalQuery {
    fn shaper(&self) -> &ResultShaper {
        &self.shaper
    }
}

impl RelationalQuery {
    fn bind(&self, context: &QueryContext<'_>) -> Result<Vec<Value>, StorageError> {
        self.parameter_names
            .iter()
            .map(|name| context.parameter(name).cloned())
            .collect()
    }
}

type Connector<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// A [`DataStore`] over a relational database.
pub struct RelationalStore<C: RelationalConnection> {
    name: String,
    model: Arc<Model>,
    options: StoreOptions,
    connector: Connector<C>,
    cache: CompiledQueryCache<Arc<RelationalQuery>>,
}

/// A store over one SQLite database file.
pub type SqliteStore = RelationalStore<SqliteConnection>;

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, model: Arc<Model>, options: StoreOptions) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        RelationalStore::new(&name, model, options, move || SqliteConnection::new(&path))
    }
}

impl<C: RelationalConnection + 'static> RelationalStore<C> {
    /// `connector` makes a new, closed connection each time it is called.
    pub fn new(
        name: &str,
        model: Arc<Model>,
        options: StoreOptions,
        connector: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        RelationalStore {
            name: name.to_string(),
            model,
            options,
            connector: Arc::new(connector),
            cache: CompiledQueryCache::new(),
        }
    }

    fn connect(&self) -> C {
        (self.connector)()
    }

    fn creator(&self) -> StoreCreator {
        StoreCreator::new(self.options.retry.clone())
            .with_sensitive_data_logging(self.options.sensitive_data_logging)
    }

    /// Returns `true` if the database exists.
    pub fn exists(&self) -> Result<bool, StorageError> {
        self.connect().exists()
    }

    /// Creates the database, retrying transient failures, and the tables of
    /// the model if the database has none. Returns `true` if anything was
    /// created.
    pub fn ensure_created(&self) -> Result<bool, StorageError> {
        let mut connection = self.connect();
        let result = self.creator().ensure_created(&mut connection, &self.model);
        crate::logging::logged(&self.name, "ensure_created", result)
    }

    pub async fn ensure_created_async(&self) -> Result<bool, StorageError> {
        let mut connection = self.connect();
        let result = self
            .creator()
            .ensure_created_async(&mut connection, &self.model)
            .await;
        crate::logging::logged(&self.name, "ensure_created_async", result)
    }

    /// Deletes the database. Returns `true` if it existed.
    pub fn ensure_deleted(&self) -> Result<bool, StorageError> {
        let mut connection = self.connect();
        let result = self.creator().ensure_deleted(&mut connection);
        crate::logging::logged(&self.name, "ensure_deleted", result)
    }

    fn run_query(
        &self,
        connection: &mut C,
        compiled: &RelationalQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        let parameters = compiled.bind(context)?;
        log_command(connection.database(), &compiled.sql, &parameters, context.sensitive_data_logging);
        let mut rows = Vec::new();
        connection.query(&compiled.sql, &parameters, &mut |row: &dyn ValueReader| {
            context.check_cancelled()?;
            rows.push(read_row(row)?);
            Ok(())
        })?;
        Ok(rows)
    }
}

#[async_trait]
impl<C: RelationalConnection + 'static> DataStore for RelationalStore<C> {
    type Compiled = RelationalQuery;

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn compiled_query_cache(&self) -> &CompiledQueryCache<Arc<RelationalQuery>> {
        &self.cache
    }

    fn compile_query(&self, query: &QueryModel) -> Result<RelationalQuery, StorageError> {
        let translation = translate(&self.model, &MaterializerFactory, query)?;
        let generated = generate_select(&translation.select);
        tracing::debug!(store = %self.name, sql = %generated.text, "compiled query");
        Ok(RelationalQuery {
            sql: generated.text,
            parameter_names: generated.parameter_names,
            shaper: translation.shaper,
        })
    }

    fn execute_query(
        &self,
        compiled: &RelationalQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        let mut connection = self.connect();
        connection.open()?;
        let result = self.run_query(&mut connection, compiled, context);
        connection.close();
        result
    }

    async fn execute_query_async(
        &self,
        compiled: &RelationalQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        context.check_cancelled()?;
        let mut connection = self.connect();
        connection.open_async().await?;

        let result = async {
            context.check_cancelled()?;
            let parameters = compiled.bind(context)?;
            log_command(connection.database(), &compiled.sql, &parameters, context.sensitive_data_logging);
            let mut rows = Vec::new();
            let mut visit = |row: &dyn ValueReader| -> Result<(), StorageError> {
                context.check_cancelled()?;
                rows.push(read_row(row)?);
                Ok(())
            };
            connection
                .query_async(&compiled.sql, &parameters, &mut visit)
                .await?;
            Ok::<_, StorageError>(rows)
        }
        .await;

        connection.close();
        result
    }

    fn save_entries(&self, entries: &[PendingEntry]) -> Result<usize, StorageError> {
        let batches = CommandBatchPreparer.batch_commands(&self.model, entries, &self.options)?;
        let mut connection = self.connect();
        BatchExecutor.execute(&batches, &mut connection, &self.options)
    }

    async fn save_entries_async(
        &self,
        entries: &[PendingEntry],
        cancellation: &CancellationToken,
    ) -> Result<usize, StorageError> {
        let batches = CommandBatchPreparer.batch_commands(&self.model, entries, &self.options)?;
        let mut connection = self.connect();
        BatchExecutor
            .execute_async(&batches, &mut connection, &self.options, cancellation)
            .await
    }
}

#[cfg(test)]
mod tests {
    use quarry_core::entity::values;
    use quarry_core::{Entity, EntityTypeDef, EntityTypeId, Expr, Property, ValueType};

    use super::*;

    fn blog_model() -> Arc<Model> {
        let mut model = Model::new();
        model
            .add_entity_type(
                EntityTypeDef::new("Blog")
                    .property(Property::new("Id", ValueType::Integer))
                    .property(Property::new("Url", ValueType::Text))
                    .key(&["Id"]),
            )
            .unwrap();
        Arc::new(model)
    }

    fn blog(id: i64, url: &str) -> PendingEntry {
        PendingEntry::added(
            EntityTypeId(0),
            values([("Id", Value::Integer(id)), ("Url", Value::from(url))]),
        )
    }

    #[test]
    fn ensure_created_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("blogs.db"), blog_model(), StoreOptions::default());
        assert!(!store.exists().unwrap());
        assert!(store.ensure_created().unwrap());
        assert!(!store.ensure_created().unwrap());
        assert!(store.exists().unwrap());
        assert!(store.ensure_deleted().unwrap());
        assert!(!store.ensure_deleted().unwrap());
    }

    #[test]
    fn saved_rows_come_back_with_parameters_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("blogs.db"), blog_model(), StoreOptions::default());
        store.ensure_created().unwrap();
        assert_eq!(
            store
                .save_changes(&[blog(1, "a.example"), blog(2, "b.example")])
                .unwrap(),
            2
        );

        let query = QueryModel::entities(EntityTypeId(0));
        let source = query.root_source();
        let query = query
            .filter(Expr::equals(Expr::property(source, "Id"), Expr::parameter("id")))
            .with_parameter("id", 2i64);
        let found: Vec<Entity> = store
            .query::<Entity>(&query)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("Url"), Some(&Value::from("b.example")));
    }

    #[test]
    fn compiled_sql_is_cached_per_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("blogs.db"), blog_model(), StoreOptions::default());
        store.ensure_created().unwrap();

        let query = QueryModel::entities(EntityTypeId(0));
        let source = query.root_source();
        let query = query.filter(Expr::equals(Expr::property(source, "Id"), Expr::parameter("id")));
        let first = store.compiled_query(&query.clone().with_parameter("id", 1i64)).unwrap();
        let second = store.compiled_query(&query.with_parameter("id", 2i64)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.compiled_query_cache().len(), 1);
        insta::assert_snapshot!(first.sql, @r#"SELECT "t0"."Id", "t0"."Url" FROM "Blog" AS "t0" WHERE "t0"."Id" = ?1"#);
    }

    #[test]
    fn query_against_missing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("missing.db"), blog_model(), StoreOptions::default());
        let err = store.query::<Entity>(&QueryModel::entities(EntityTypeId(0))).err();
        assert!(matches!(err, Some(StorageError::Sqlite(_))));
        assert!(!store.exists().unwrap());
    }
}
