//! The [`DataStore`] trait shared by every backend.
//!
//! A backend supplies compilation of a [`QueryModel`] into its own compiled
//! form, execution of a compiled query into raw rows, and persistence of
//! pending entries. The trait's provided methods add the parts every backend
//! shares: the compiled-query cache lookup, per-call [`QueryContext`]s, lazy
//! materialization of results, and error logging.

use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{FromMaterialized, Model, PendingEntry, QueryModel, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::CompiledQueryCache;
use crate::context::{CompiledQuery, QueryContext, QueryResults, QueryStream};
use crate::error::StorageError;
use crate::fingerprint::fingerprint;
use crate::logging::logged;
use crate::options::StoreOptions;

/// A queryable, persistable store of entities.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// The backend's compiled query.
    type Compiled: CompiledQuery + 'static;

    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn model(&self) -> &Model;

    fn options(&self) -> &StoreOptions;

    fn compiled_query_cache(&self) -> &CompiledQueryCache<Arc<Self::Compiled>>;

    /// Compiles `query`. Called at most once per query shape.
    fn compile_query(&self, query: &QueryModel) -> Result<Self::Compiled, StorageError>;

    /// Runs a compiled query, returning its raw rows.
    fn execute_query(
        &self,
        compiled: &Self::Compiled,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError>;

    async fn execute_query_async(
        &self,
        compiled: &Self::Compiled,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError>;

    /// Persists a non-empty list of entries. Returns the affected row count.
    fn save_entries(&self, entries: &[PendingEntry]) -> Result<usize, StorageError>;

    async fn save_entries_async(
        &self,
        entries: &[PendingEntry],
        cancellation: &CancellationToken,
    ) -> Result<usize, StorageError>;

    // -----------------------------------------------------------------------
    // Provided
    // -----------------------------------------------------------------------

    /// Returns the compiled form of `query`, compiling it on first use of its
    /// shape.
    fn compiled_query(&self, query: &QueryModel) -> Result<Arc<Self::Compiled>, StorageError> {
        let key = fingerprint(query)?;
        self.compiled_query_cache()
            .get_or_add(key, || self.compile_query(query).map(Arc::new))
    }

    /// Runs `query` and returns its results, materialized as they are pulled.
    /// Iterating again requires calling `query` again.
    fn query<T: FromMaterialized>(&self, query: &QueryModel) -> Result<QueryResults<T>, StorageError> {
        let result = (|| -> Result<QueryResults<T>, StorageError> {
            let compiled = self.compiled_query(query)?;
            let context = QueryContext::new(
                self.name(),
                &query.parameters,
                self.options().sensitive_data_logging,
            );
            let rows = {
                let _entered = context.span.enter();
                self.execute_query(&compiled, &context)?
            };
            tracing::debug!(store = %self.name(), rows = rows.len(), "query executed");
            Ok(QueryResults::new(rows, compiled.shaper().clone()).logged_as(self.name(), "query"))
        })();
        logged(self.name(), "query", result)
    }

    /// Async form of [`DataStore::query`]. Once `cancellation` fires, execution
    /// stops at its next suspension point and the stream yields
    /// [`StorageError::Cancelled`].
    async fn query_async<T>(
        &self,
        query: &QueryModel,
        cancellation: CancellationToken,
    ) -> Result<QueryStream<T>, StorageError>
    where
        T: FromMaterialized + Send + 'static,
    {
        let result = async {
            let compiled = self.compiled_query(query)?;
            let context = QueryContext::new(
                self.name(),
                &query.parameters,
                self.options().sensitive_data_logging,
            )
            .with_cancellation(&cancellation);
            context.check_cancelled()?;
            let span = context.span.clone();
            let rows = self
                .execute_query_async(&compiled, &context)
                .instrument(span)
                .await?;
            context.check_cancelled()?;
            let results =
                QueryResults::new(rows, compiled.shaper().clone()).logged_as(self.name(), "query_async");
            Ok::<_, StorageError>(QueryStream::new(results, cancellation.clone()))
        }
        .await;
        logged(self.name(), "query_async", result)
    }

    /// Persists `entries` as one unit. An empty list issues no commands.
    fn save_changes(&self, entries: &[PendingEntry]) -> Result<usize, StorageError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let result = self.save_entries(entries);
        if let Ok(affected) = &result {
            tracing::debug!(store = %self.name(), entries = entries.len(), affected, "saved changes");
        }
        logged(self.name(), "save_changes", result)
    }

    async fn save_changes_async(
        &self,
        entries: &[PendingEntry],
        cancellation: CancellationToken,
    ) -> Result<usize, StorageError> {
        if cancellation.is_cancelled() {
            return logged(self.name(), "save_changes_async", Err(StorageError::Cancelled));
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let result = self.save_entries_async(entries, &cancellation).await;
        if let Ok(affected) = &result {
            tracing::debug!(store = %self.name(), entries = entries.len(), affected, "saved changes");
        }
        logged(self.name(), "save_changes_async", result)
    }
}
