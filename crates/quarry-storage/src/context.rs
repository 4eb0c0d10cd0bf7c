//! Per-call query execution state and lazy result sequences.
//!
//! A [`QueryContext`] is built fresh for every `query` call. It carries the
//! call's parameter values, the logging span, and the cancellation token.
//! Backends execute a compiled query into a buffer of raw rows; the
//! [`QueryResults`] iterator (sync) and [`QueryStream`] (async) then
//! materialize one row at a time as the caller pulls.
//!
//! Both sequences are single-use: iterating a query again means calling
//! `query` again, which re-executes it. After the first error a sequence
//! yields nothing more. Errors raised while iterating are logged under the
//! owning store's name, like errors from `query` itself.
//!
//! Rows are read in full before the first one is handed out, so a database
//! error while reading surfaces from `query` with no rows delivered. Only
//! materialization and cancellation errors can interrupt a sequence midway.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use indexmap::IndexMap;
use quarry_core::{FromMaterialized, Materialized, Value, ValueType};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::logging::log_failure;
use crate::materializer::Materializer;
use crate::value_reader::{ArrayValueReader, ValueReader};

/// Turns one raw row into the query's result shape.
#[derive(Debug, Clone)]
pub enum ResultShaper {
    Entity(Materializer),
    Entities(Vec<Materializer>),
    /// (row index, declared type) per selected property.
    Values(Vec<(usize, ValueType)>),
}

impl ResultShaper {
    pub fn shape(&self, reader: &dyn ValueReader) -> Result<Materialized, StorageError> {
        match self {
            ResultShaper::Entity(materializer) => {
                Ok(Materialized::Entity(materializer.materialize(reader)?))
            }
            ResultShaper::Entities(materializers) => {
                let parts = materializers
                    .iter()
                    .map(|m| m.materialize(reader).map(Materialized::Entity))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Materialized::Tuple(parts))
            }
            ResultShaper::Values(columns) => {
                let values = columns
                    .iter()
                    .map(|(index, value_type)| reader.read_value(*index, *value_type))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Materialized::Values(values))
            }
        }
    }
}

/// A compiled, reusable query executor.
pub trait CompiledQuery: Send + Sync {
    fn shaper(&self) -> &ResultShaper;
}

/// State of one query execution.
pub struct QueryContext<'a> {
    pub store: &'a str,
    pub parameters: &'a IndexMap<String, Value>,
    pub span: tracing::Span,
    pub cancellation: Option<&'a CancellationToken>,
    pub sensitive_data_logging: bool,
}

impl<'a> QueryContext<'a> {
    pub fn new(store: &'a str, parameters: &'a IndexMap<String, Value>, sensitive_data_logging: bool) -> Self {
        QueryContext {
            store,
            parameters,
            span: tracing::debug_span!("query", store = %store),
            cancellation: None,
            sensitive_data_logging,
        }
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fails with [`StorageError::Cancelled`] once the token fires.
    pub fn check_cancelled(&self) -> Result<(), StorageError> {
        match self.cancellation {
            Some(token) if token.is_cancelled() => Err(StorageError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Value of parameter `name`.
    pub fn parameter(&self, name: &str) -> Result<&Value, StorageError> {
        self.parameters.get(name).ok_or_else(|| {
            StorageError::invalid_argument(name, "no value supplied for query parameter")
        })
    }
}

// ---------------------------------------------------------------------------
// Result sequences
// ---------------------------------------------------------------------------

/// Lazily materialized results of a synchronous query.
pub struct QueryResults<T> {
    rows: std::vec::IntoIter<Vec<Value>>,
    shaper: ResultShaper,
    done: bool,
    /// (store, operation) that failures are logged under.
    origin: Option<(String, &'static str)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromMaterialized> QueryResults<T> {
    pub fn new(rows: Vec<Vec<Value>>, shaper: ResultShaper) -> Self {
        QueryResults {
            rows: rows.into_iter(),
            shaper,
            done: false,
            origin: None,
            _marker: PhantomData,
        }
    }

    /// Logs every failure this sequence yields as a failure of `operation`
    /// on `store`.
    pub fn logged_as(mut self, store: &str, operation: &'static str) -> Self {
        self.origin = Some((store.to_string(), operation));
        self
    }

    fn fail(&mut self, error: StorageError) -> StorageError {
        self.done = true;
        if let Some((store, operation)) = &self.origin {
            log_failure(store, operation, &error);
        }
        error
    }

    fn next_row(&mut self) -> Option<Result<T, StorageError>> {
        if self.done {
            return None;
        }
        let row = self.rows.next()?;
        let result = self
            .shaper
            .shape(&ArrayValueReader::new(&row))
            .and_then(|m| T::from_materialized(m).map_err(StorageError::from));
        Some(result.map_err(|e| self.fail(e)))
    }

    /// Rows not yet materialized.
    pub fn remaining(&self) -> usize {
        if self.done {
            0
        } else {
            self.rows.len()
        }
    }
}

impl<T: FromMaterialized> Iterator for QueryResults<T> {
    type Item = Result<T, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

/// Lazily materialized results of an asynchronous query.
///
/// Checks the cancellation token before every row; once it fires the stream
/// yields [`StorageError::Cancelled`] and ends.
pub struct QueryStream<T> {
    results: QueryResults<T>,
    cancellation: CancellationToken,
}

impl<T: FromMaterialized> QueryStream<T> {
    pub fn new(results: QueryResults<T>, cancellation: CancellationToken) -> Self {
        QueryStream {
            results,
            cancellation,
        }
    }
}

impl<T: FromMaterialized> Stream for QueryStream<T> {
    type Item = Result<T, StorageError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.results.done {
            return Poll::Ready(None);
        }
        if this.cancellation.is_cancelled() {
            return Poll::Ready(Some(Err(this.results.fail(StorageError::Cancelled))));
        }
        Poll::Ready(this.results.next_row())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use parking_lot::Mutex;
    use quarry_core::Entity;

    use super::*;

    fn values_shaper() -> ResultShaper {
        ResultShaper::Values(vec![(0, ValueType::Integer)])
    }

    fn rows(values: &[Value]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![v.clone()]).collect()
    }

    #[test]
    fn results_stop_at_first_error() {
        let data = rows(&[Value::Integer(1), Value::from("bad"), Value::Integer(3)]);
        let mut results: QueryResults<Value> = QueryResults::new(data, values_shaper());
        assert_eq!(results.next().unwrap().unwrap(), Value::Integer(1));
        assert!(results.next().unwrap().is_err());
        assert!(results.next().is_none());
    }

    #[test]
    fn shape_mismatch_surfaces_as_error() {
        let data = rows(&[Value::Integer(1)]);
        let mut results: QueryResults<Entity> = QueryResults::new(data, values_shaper());
        assert!(matches!(
            results.next().unwrap().unwrap_err(),
            StorageError::Core(_)
        ));
    }

    #[test]
    fn missing_parameter_is_invalid_argument() {
        let parameters = IndexMap::new();
        let context = QueryContext::new("test", &parameters, false);
        assert!(matches!(
            context.parameter("name").unwrap_err(),
            StorageError::InvalidArgument { .. }
        ));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn capture<R>(f: impl FnOnce() -> R) -> (R, String) {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, log.text())
    }

    #[test]
    fn failures_during_iteration_are_logged_with_the_store_name() {
        let data = rows(&[Value::Integer(1), Value::from("abc")]);
        let (collected, log) = capture(|| {
            QueryResults::<Value>::new(data, values_shaper())
                .logged_as("blogs", "query")
                .collect::<Vec<_>>()
        });
        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_err());
        assert!(log.contains("data store operation failed"), "{log}");
        assert!(log.contains("blogs"), "{log}");
        assert!(log.contains("query"), "{log}");
    }

    #[test]
    fn successful_iteration_logs_nothing() {
        let data = rows(&[Value::Integer(1), Value::Integer(2)]);
        let (collected, log) = capture(|| {
            QueryResults::<Value>::new(data, values_shaper())
                .logged_as("blogs", "query")
                .collect::<Result<Vec<_>, _>>()
        });
        assert_eq!(collected.unwrap().len(), 2);
        assert!(log.is_empty(), "{log}");
    }

    #[tokio::test]
    async fn stream_honors_cancellation() {
        let data = rows(&[Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        let token = CancellationToken::new();
        let mut stream: QueryStream<Value> =
            QueryStream::new(QueryResults::new(data, values_shaper()), token.clone());

        assert_eq!(stream.next().await.unwrap().unwrap(), Value::Integer(1));
        token.cancel();
        assert!(stream.next().await.unwrap().unwrap_err().is_cancelled());
        assert!(stream.next().await.is_none());
    }
}
