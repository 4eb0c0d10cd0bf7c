//! Query execution and change persistence for quarry models.
//!
//! Provides the [`DataStore`] trait with its two public operation families,
//! `query` and `save_changes` (each sync and async), plus the
//! [`InMemoryStore`] and [`SqliteStore`] backends.
//!
//! # Architecture
//!
//! Queries are translated once per shape into a [`select::SelectExpr`]
//! (projection, joins, predicates) while the [`MaterializerFactory`] builds
//! the row-to-entity functions, including discriminator dispatch for
//! single-table hierarchies. The result is cached per store in a
//! [`CompiledQueryCache`] keyed by a parameter-free [`QueryFingerprint`].
//!
//! Saves turn pending entries into [`batch::ModificationCommand`]s, order
//! them by foreign keys into batches, and run them in one transaction.
//! Database creation retries transient failures through [`StoreCreator`].
//!
//! # Modules
//!
//! - [`error`]: StorageError and its transient/fatal classification
//! - [`options`]: StoreOptions and RetryConfig
//! - [`value_reader`]: positional row access
//! - [`select`]: the select/alias expression tree
//! - [`sql`]: SQL text generation
//! - [`materializer`]: MaterializerFactory and Materializer
//! - [`fingerprint`]: structural query keys
//! - [`cache`]: CompiledQueryCache with single-flight compilation
//! - [`context`]: QueryContext and lazy result sequences
//! - [`compile`]: QueryModel to SelectExpr translation
//! - [`traits`]: DataStore trait definition
//! - [`memory`]: InMemoryStore implementation
//! - [`connection`]: RelationalConnection and its SQLite implementation
//! - [`batch`]: modification commands and dependency-ordered batching
//! - [`executor`]: transactional batch execution
//! - [`creator`]: database creation with retry
//! - [`relational`]: RelationalStore and SqliteStore

pub mod batch;
pub mod cache;
pub mod compile;
pub mod connection;
pub mod context;
pub mod creator;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod logging;
pub mod materializer;
pub mod memory;
pub mod options;
pub mod relational;
pub mod select;
pub mod sql;
pub mod traits;
pub mod value_reader;

// Re-export key types for ergonomic use.
pub use batch::{CommandBatch, CommandBatchPreparer, ModificationCommand};
pub use cache::CompiledQueryCache;
pub use connection::{RelationalConnection, RowVisitor, SqliteConnection};
pub use context::{CompiledQuery, QueryContext, QueryResults, QueryStream, ResultShaper};
pub use creator::{CreatorState, RetryState, RetryStep, StoreCreator};
pub use error::{ConnectionErrorKind, StorageError};
pub use executor::{BatchExecutor, TransactionScope};
pub use fingerprint::{fingerprint, QueryFingerprint};
pub use materializer::{Materializer, MaterializerFactory};
pub use memory::{InMemoryDatabase, InMemoryStore, MemoryQuery};
pub use options::{RetryConfig, StoreOptions};
pub use relational::{RelationalQuery, RelationalStore, SqliteStore};
pub use traits::DataStore;
pub use value_reader::{ArrayValueReader, ValueReader};
