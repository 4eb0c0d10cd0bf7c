//! Stable ID newtypes for model and query elements.
//!
//! All IDs are distinct newtype wrappers over `u32`, so an `EntityTypeId`
//! cannot be used where a `QuerySourceId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity type identity within a [`Model`](crate::model::Model).
///
/// The inner value is the registration index of the entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTypeId(pub u32);

/// Identity of one entity-typed source (a `FROM` or `JOIN` item) inside a
/// single [`QueryModel`](crate::query::QueryModel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySourceId(pub u32);

// Display implementations -- just print the inner value.

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QuerySourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_id_display() {
        assert_eq!(format!("{}", EntityTypeId(7)), "7");
    }

    #[test]
    fn query_source_id_display() {
        assert_eq!(format!("{}", QuerySourceId(0)), "0");
    }

    #[test]
    fn serde_roundtrip() {
        let id = EntityTypeId(42);
        let json = serde_json::to_string(&id).unwrap();
        let back: EntityTypeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
