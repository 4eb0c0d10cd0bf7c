//! Metadata and query model for the quarry data-access layer.
//!
//! This crate holds the immutable inputs the storage layer consumes:
//!
//! - [`model`]: entity types, properties, single-table hierarchies with
//!   discriminators, foreign keys
//! - [`query`]: the logical query model (sources, filters, joins, ordering,
//!   paging, selectors)
//! - [`entity`]: materialized entities, result conversion, pending entries
//! - [`value`]: scalar values and declared value types

pub mod entity;
pub mod error;
pub mod id;
pub mod model;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use entity::{Entity, EntityKey, EntityState, FromMaterialized, Materialized, PendingEntry};
pub use error::CoreError;
pub use id::{EntityTypeId, QuerySourceId};
pub use model::{EntityType, EntityTypeDef, ForeignKey, ForeignKeyDef, Model, ModelDef, Property};
pub use query::{CompareOp, Direction, Expr, JoinClause, Ordering, QueryModel, QuerySource, Selector};
pub use value::{DiscriminatorKey, Value, ValueType};
