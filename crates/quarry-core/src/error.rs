//! Core error types for quarry-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! model construction, model validation, and value conversion failures.

use thiserror::Error;

use crate::id::{EntityTypeId, QuerySourceId};
use crate::value::ValueType;

/// Core errors produced by the quarry-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Attempting to register an entity type name that already exists.
    #[error("duplicate entity type name: '{name}'")]
    DuplicateEntityType { name: String },

    /// An entity type ID was not found in the model.
    #[error("entity type not found: EntityTypeId({id})", id = id.0)]
    EntityTypeNotFound { id: EntityTypeId },

    /// An entity type name was not found in the model.
    #[error("entity type not found: '{name}'")]
    EntityTypeNameNotFound { name: String },

    /// A property name was not found on an entity type.
    #[error("property '{property}' not found on entity type '{entity_type}'")]
    PropertyNotFound {
        entity_type: String,
        property: String,
    },

    /// A query referenced a source that the query model does not declare.
    #[error("query source not found: QuerySourceId({id})", id = id.0)]
    QuerySourceNotFound { id: QuerySourceId },

    /// The inheritance configuration of a hierarchy is inconsistent.
    #[error("invalid hierarchy rooted at '{root}': {reason}")]
    InvalidHierarchy { root: String, reason: String },

    /// Two concrete types of one hierarchy share a discriminator value.
    #[error("duplicate discriminator value {value} in hierarchy '{root}'")]
    DuplicateDiscriminator { root: String, value: String },

    /// A value could not be converted to the declared type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: String },

    /// A query result could not be converted to the requested shape.
    #[error("result shape mismatch: expected {expected}")]
    ResultShape { expected: String },
}
