//! Entity instances, query results, and pending mutation records.
//!
//! - [`Entity`]: a materialized instance of one concrete entity type.
//! - [`Materialized`] / [`FromMaterialized`]: the untyped result of one query
//!   row and the conversion into caller types.
//! - [`PendingEntry`]: one add/modify/delete produced by change tracking,
//!   consumed by `save_changes`.
//! - [`EntityKey`]: hashable key values identifying one row.

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::id::EntityTypeId;
use crate::model::Model;
use crate::value::Value;

/// A materialized entity of one concrete type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub entity_type: EntityTypeId,
    pub type_name: String,
    /// Property values in the type's property order.
    pub values: IndexMap<String, Value>,
}

impl Entity {
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Returns `true` if this entity's concrete type is named `type_name`.
    pub fn is(&self, type_name: &str) -> bool {
        self.type_name == type_name
    }
}

/// The result of materializing one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Materialized {
    Entity(Entity),
    Values(Vec<Value>),
    Tuple(Vec<Materialized>),
}

/// Conversion from a materialized row into a caller-facing type.
pub trait FromMaterialized: Sized {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError>;
}

impl FromMaterialized for Materialized {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError> {
        Ok(row)
    }
}

impl FromMaterialized for Entity {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError> {
        match row {
            Materialized::Entity(entity) => Ok(entity),
            _ => Err(CoreError::ResultShape {
                expected: "entity".to_string(),
            }),
        }
    }
}

impl FromMaterialized for Vec<Value> {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError> {
        match row {
            Materialized::Values(values) => Ok(values),
            _ => Err(CoreError::ResultShape {
                expected: "value list".to_string(),
            }),
        }
    }
}

impl FromMaterialized for Value {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError> {
        match row {
            Materialized::Values(mut values) if values.len() == 1 => Ok(values.remove(0)),
            _ => Err(CoreError::ResultShape {
                expected: "single value".to_string(),
            }),
        }
    }
}

impl FromMaterialized for (Entity, Entity) {
    fn from_materialized(row: Materialized) -> Result<Self, CoreError> {
        match row {
            Materialized::Tuple(parts) if parts.len() == 2 => {
                let mut parts = parts.into_iter();
                match (parts.next(), parts.next()) {
                    (Some(Materialized::Entity(a)), Some(Materialized::Entity(b))) => Ok((a, b)),
                    _ => Err(CoreError::ResultShape {
                        expected: "pair of entities".to_string(),
                    }),
                }
            }
            _ => Err(CoreError::ResultShape {
                expected: "pair of entities".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Key values of one row, in key-property order.
///
/// Equality and hashing compare reals bitwise so the key can live in hash
/// maps.
#[derive(Debug, Clone)]
pub struct EntityKey(pub SmallVec<[Value; 2]>);

impl EntityKey {
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(other.0.iter()).all(|(a, b)| match (a, b) {
                (Value::Real(x), Value::Real(y)) => x.to_bits() == y.to_bits(),
                _ => a == b,
            })
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in &self.0 {
            match value {
                Value::Null => 0u8.hash(state),
                Value::Bool(b) => (1u8, b).hash(state),
                Value::Integer(i) => (2u8, i).hash(state),
                Value::Real(r) => (3u8, r.to_bits()).hash(state),
                Value::Text(s) => (4u8, s).hash(state),
                Value::Blob(b) => (5u8, b).hash(state),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pending entries
// ---------------------------------------------------------------------------

/// What `save_changes` should do with an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
}

/// One pending mutation produced by change tracking.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub entity_type: EntityTypeId,
    pub state: EntityState,
    /// Current property values.
    pub current: IndexMap<String, Value>,
    /// Values as last loaded from the store; supplies the key of modified and
    /// deleted entries.
    pub original: IndexMap<String, Value>,
}

impl PendingEntry {
    pub fn added(entity_type: EntityTypeId, values: IndexMap<String, Value>) -> Self {
        PendingEntry {
            entity_type,
            state: EntityState::Added,
            current: values,
            original: IndexMap::new(),
        }
    }

    pub fn modified(
        entity_type: EntityTypeId,
        original: IndexMap<String, Value>,
        current: IndexMap<String, Value>,
    ) -> Self {
        PendingEntry {
            entity_type,
            state: EntityState::Modified,
            current,
            original,
        }
    }

    pub fn deleted(entity_type: EntityTypeId, original: IndexMap<String, Value>) -> Self {
        PendingEntry {
            entity_type,
            state: EntityState::Deleted,
            current: IndexMap::new(),
            original,
        }
    }

    /// Value of `property` as it should be identified in the store: the
    /// original value for modified/deleted entries, else the current one.
    pub fn identifying_value(&self, property: &str) -> Option<&Value> {
        match self.state {
            EntityState::Added => self.current.get(property),
            EntityState::Modified | EntityState::Deleted => self
                .original
                .get(property)
                .or_else(|| self.current.get(property)),
        }
    }

    /// Key of the row this entry targets.
    pub fn key(&self, model: &Model) -> Result<EntityKey, CoreError> {
        let mut values = SmallVec::new();
        for property in model.key_properties(self.entity_type)? {
            let value = self.identifying_value(&property.name).ok_or_else(|| {
                CoreError::PropertyNotFound {
                    entity_type: model
                        .entity_type(self.entity_type)
                        .map(|t| t.name.clone())
                        .unwrap_or_default(),
                    property: property.name.clone(),
                }
            })?;
            values.push(value.clone());
        }
        Ok(EntityKey(values))
    }
}

/// Builds an ordered property map from `(name, value)` pairs.
pub fn values<const N: usize>(pairs: [(&str, Value); N]) -> IndexMap<String, Value> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::model::{EntityTypeDef, Property};
    use crate::value::ValueType;

    fn blog_model() -> Model {
        let mut model = Model::new();
        model
            .add_entity_type(
                EntityTypeDef::new("Blog")
                    .property(Property::new("Url", ValueType::Text))
                    .property(Property::new("Name", ValueType::Text).nullable())
                    .key(&["Url"]),
            )
            .unwrap();
        model
    }

    #[test]
    fn added_entry_key_comes_from_current() {
        let model = blog_model();
        let entry = PendingEntry::added(
            EntityTypeId(0),
            values([("Url", Value::from("http://a")), ("Name", Value::Null)]),
        );
        assert_eq!(entry.key(&model).unwrap().values(), &[Value::from("http://a")]);
    }

    #[test]
    fn modified_entry_key_comes_from_original() {
        let model = blog_model();
        let entry = PendingEntry::modified(
            EntityTypeId(0),
            values([("Url", Value::from("http://old"))]),
            values([("Url", Value::from("http://new"))]),
        );
        assert_eq!(entry.key(&model).unwrap().values(), &[Value::from("http://old")]);
    }

    #[test]
    fn missing_key_is_an_error() {
        let model = blog_model();
        let entry = PendingEntry::added(EntityTypeId(0), values([("Name", Value::from("x"))]));
        assert!(matches!(
            entry.key(&model).unwrap_err(),
            CoreError::PropertyNotFound { .. }
        ));
    }

    #[test]
    fn keys_hash_consistently() {
        let a = EntityKey(SmallVec::from_vec(vec![Value::Real(1.5), Value::from("x")]));
        let b = EntityKey(SmallVec::from_vec(vec![Value::Real(1.5), Value::from("x")]));
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let row = Materialized::Values(vec![Value::Integer(1)]);
        assert!(Entity::from_materialized(row.clone()).is_err());
        assert_eq!(Value::from_materialized(row).unwrap(), Value::Integer(1));
    }
}
