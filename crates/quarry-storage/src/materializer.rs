//! Row-to-entity materializers.
//!
//! [`MaterializerFactory::create_materializer`] builds, once per entity type
//! and projection shape, a [`Materializer`] that turns a [`ValueReader`] into
//! an [`Entity`]. While building it registers every property column with the
//! select expression through the caller's projection adder and, for types
//! that share a table with other types, installs a discriminator predicate
//! for the query source.
//!
//! Three cases, by the concrete types in the requested type's hierarchy:
//!
//! - one concrete type that is the root: a plain materializer, no
//!   discriminator involvement at all;
//! - one concrete type below the root: a plain materializer plus an equality
//!   predicate on the discriminator column;
//! - several concrete types: a dispatching materializer that reads the
//!   discriminator once per row and looks the concrete type up in a map,
//!   plus an `OR` of equality predicates restricting rows to the known
//!   discriminator values.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use quarry_core::{DiscriminatorKey, Entity, EntityTypeId, Model, Property, QuerySourceId, Value, ValueType};

use crate::error::StorageError;
use crate::select::{SelectExpr, SqlExpr};
use crate::value_reader::ValueReader;

/// Reads the properties of one concrete type from fixed row positions.
#[derive(Debug)]
pub struct EntityShaper {
    entity_type: EntityTypeId,
    type_name: String,
    /// (property name, row index, declared type)
    columns: Vec<(String, usize, ValueType)>,
}

impl EntityShaper {
    fn shape(&self, reader: &dyn ValueReader) -> Result<Entity, StorageError> {
        let mut values = IndexMap::with_capacity(self.columns.len());
        for (name, index, value_type) in &self.columns {
            values.insert(name.clone(), reader.read_value(*index, *value_type)?);
        }
        Ok(Entity {
            entity_type: self.entity_type,
            type_name: self.type_name.clone(),
            values,
        })
    }
}

/// Builds entities from rows. Immutable once built and cheap to clone.
#[derive(Debug, Clone)]
pub enum Materializer {
    /// Exactly one possible concrete type.
    Plain(Arc<EntityShaper>),
    /// Concrete type chosen per row by discriminator value.
    Discriminating {
        root_name: String,
        discriminator_index: usize,
        discriminator_type: ValueType,
        shapers: Arc<HashMap<DiscriminatorKey, Arc<EntityShaper>>>,
    },
}

impl Materializer {
    pub fn materialize(&self, reader: &dyn ValueReader) -> Result<Entity, StorageError> {
        match self {
            Materializer::Plain(shaper) => shaper.shape(reader),
            Materializer::Discriminating {
                root_name,
                discriminator_index,
                discriminator_type,
                shapers,
            } => {
                let value = reader.read_value(*discriminator_index, *discriminator_type)?;
                let shaper = value
                    .discriminator_key()
                    .and_then(|key| shapers.get(&key))
                    .ok_or_else(|| StorageError::UnableToDiscriminate {
                        entity_type: root_name.clone(),
                        value: value.to_string(),
                    })?;
                shaper.shape(reader)
            }
        }
    }

    /// Returns `true` if rows are dispatched on a discriminator column.
    pub fn consults_discriminator(&self) -> bool {
        matches!(self, Materializer::Discriminating { .. })
    }
}

/// Creates [`Materializer`]s. Stateless.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaterializerFactory;

impl MaterializerFactory {
    /// Builds the materializer for `entity_type` read through `source`.
    ///
    /// `projection_adder` appends a property's column to `select` and returns
    /// its row index. The factory calls it once per property of every
    /// concrete type; deduplication is up to the adder.
    pub fn create_materializer<F>(
        &self,
        model: &Model,
        entity_type: EntityTypeId,
        select: &mut SelectExpr,
        mut projection_adder: F,
        source: QuerySourceId,
    ) -> Result<Materializer, StorageError>
    where
        F: FnMut(&mut SelectExpr, &Property) -> usize,
    {
        let concrete = model.concrete_types_in_hierarchy(entity_type)?;
        let root = model.root_type(entity_type)?;

        let mut shapers = Vec::with_capacity(concrete.len());
        for ty in &concrete {
            let columns = model
                .properties(ty.id)?
                .into_iter()
                .map(|p| (p.name.clone(), projection_adder(select, p), p.value_type))
                .collect();
            shapers.push((
                ty,
                Arc::new(EntityShaper {
                    entity_type: ty.id,
                    type_name: ty.name.clone(),
                    columns,
                }),
            ));
        }

        match shapers.len() {
            0 => Err(StorageError::translation(format!(
                "entity type '{}' has no concrete type to materialize",
                model.entity_type(entity_type)?.name
            ))),
            1 if shapers[0].0.id == root.id => {
                let (_, shaper) = shapers.remove(0);
                Ok(Materializer::Plain(shaper))
            }
            1 => {
                let (ty, shaper) = shapers.remove(0);
                let (column, _) = discriminator_column(model, entity_type, select, source)?;
                let value = discriminator_value(ty.discriminator_value.as_ref(), &ty.name)?;
                select.set_discriminator_predicate(
                    source,
                    SqlExpr::equals(column, SqlExpr::Literal(value.clone())),
                );
                Ok(Materializer::Plain(shaper))
            }
            _ => {
                let (column, discriminator) = discriminator_column(model, entity_type, select, source)?;
                let discriminator_index = discriminator_index(model, entity_type, select, source)?;

                let mut map = HashMap::with_capacity(shapers.len());
                let mut tests = Vec::with_capacity(shapers.len());
                for (ty, shaper) in shapers {
                    let value = discriminator_value(ty.discriminator_value.as_ref(), &ty.name)?;
                    let key = value.discriminator_key().ok_or_else(|| {
                        StorageError::translation(format!(
                            "discriminator value {} of '{}' is not text or integer",
                            value, ty.name
                        ))
                    })?;
                    tests.push(SqlExpr::equals(column.clone(), SqlExpr::Literal(value.clone())));
                    // first declared type wins on duplicate values
                    map.entry(key).or_insert(shaper);
                }
                if let Some(predicate) = SqlExpr::any(tests) {
                    select.set_discriminator_predicate(source, predicate);
                }

                Ok(Materializer::Discriminating {
                    root_name: root.name.clone(),
                    discriminator_index,
                    discriminator_type: discriminator.value_type,
                    shapers: Arc::new(map),
                })
            }
        }
    }

    /// Restricts `source` to rows of `entity_type`'s concrete types without
    /// building a materializer. Used for sources that are joined or read
    /// through scalar properties only. `column_for` maps the discriminator
    /// property to its column expression; the column is added as filter-only.
    pub fn apply_discriminator_filter<F>(
        &self,
        model: &Model,
        entity_type: EntityTypeId,
        select: &mut SelectExpr,
        column_for: F,
        source: QuerySourceId,
    ) -> Result<(), StorageError>
    where
        F: FnOnce(&Property) -> SqlExpr,
    {
        let concrete = model.concrete_types_in_hierarchy(entity_type)?;
        let root = model.root_type(entity_type)?;
        if concrete.len() == 1 && concrete[0].id == root.id {
            return Ok(());
        }
        let Some(property) = model.discriminator_property(entity_type)? else {
            return Ok(());
        };
        let column = select.add_filter_column(column_for(property), Some(source));

        let tests = concrete
            .iter()
            .map(|ty| {
                let value = discriminator_value(ty.discriminator_value.as_ref(), &ty.name)?;
                Ok(SqlExpr::equals(column.clone(), SqlExpr::Literal(value.clone())))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        let predicate = SqlExpr::any(tests).ok_or_else(|| {
            StorageError::translation(format!(
                "entity type '{}' has no concrete type to query",
                model.entity_type(entity_type).map(|t| t.name.as_str()).unwrap_or("?")
            ))
        })?;
        select.set_discriminator_predicate(source, predicate);
        Ok(())
    }
}

fn discriminator_value<'a>(value: Option<&'a Value>, type_name: &str) -> Result<&'a Value, StorageError> {
    value.ok_or_else(|| {
        StorageError::translation(format!("concrete type '{}' has no discriminator value", type_name))
    })
}

/// The column expression of the discriminator of `entity_type` as read
/// through `source`. The column must already be part of `select`.
fn discriminator_column<'m>(
    model: &'m Model,
    entity_type: EntityTypeId,
    select: &SelectExpr,
    source: QuerySourceId,
) -> Result<(SqlExpr, &'m Property), StorageError> {
    let root = model.root_type(entity_type)?;
    let property = model.discriminator_property(entity_type)?.ok_or_else(|| {
        StorageError::translation(format!("hierarchy '{}' has no discriminator property", root.name))
    })?;
    let entry = select
        .find_column(source, property.column_name())
        .ok_or_else(|| {
            StorageError::translation(format!(
                "discriminator column '{}' is not part of the query",
                property.column_name()
            ))
        })?;
    Ok((entry.expr.clone(), property))
}

/// Row index of the discriminator column, which the materializer reads.
fn discriminator_index(
    model: &Model,
    entity_type: EntityTypeId,
    select: &SelectExpr,
    source: QuerySourceId,
) -> Result<usize, StorageError> {
    let (column, _) = discriminator_column(model, entity_type, select, source)?;
    select
        .projection()
        .position(|a| a.expr == column)
        .ok_or_else(|| StorageError::translation("discriminator column is not projected"))
}

#[cfg(test)]
mod tests {
    use quarry_core::{EntityTypeDef, Property};

    use super::*;
    use crate::select::TableExpr;
    use crate::value_reader::ArrayValueReader;

    fn zoo() -> Model {
        let mut model = Model::new();
        model
            .add_entity_type(
                EntityTypeDef::new("Country")
                    .property(Property::new("Id", ValueType::Integer))
                    .property(Property::new("Name", ValueType::Text))
                    .key(&["Id"]),
            )
            .unwrap();
        model
            .add_entity_type(
                EntityTypeDef::new("Animal")
                    .abstract_type()
                    .property(Property::new("Species", ValueType::Text))
                    .property(Property::new("Name", ValueType::Text))
                    .property(Property::new("Discriminator", ValueType::Text))
                    .key(&["Species"])
                    .discriminator("Discriminator"),
            )
            .unwrap();
        model
            .add_entity_type(
                EntityTypeDef::new("Bird")
                    .derives("Animal")
                    .abstract_type()
                    .property(Property::new("IsFlightless", ValueType::Bool)),
            )
            .unwrap();
        model
            .add_entity_type(
                EntityTypeDef::new("Eagle")
                    .derives("Bird")
                    .property(Property::new("Group", ValueType::Integer))
                    .discriminator_value("Eagle"),
            )
            .unwrap();
        model
            .add_entity_type(
                EntityTypeDef::new("Kiwi")
                    .derives("Bird")
                    .property(Property::new("FoundOn", ValueType::Integer))
                    .discriminator_value("Kiwi"),
            )
            .unwrap();
        model
    }

    fn select_for(table: &str) -> SelectExpr {
        SelectExpr::new(TableExpr {
            table: table.to_string(),
            alias: "t0".to_string(),
            source: QuerySourceId(0),
        })
    }

    fn create(model: &Model, name: &str, select: &mut SelectExpr) -> Materializer {
        let id = model.entity_type_by_name(name).unwrap().id;
        MaterializerFactory
            .create_materializer(
                model,
                id,
                select,
                |s, p| s.add_to_projection(SqlExpr::column("t0", p.column_name()), Some(QuerySourceId(0))),
                QuerySourceId(0),
            )
            .unwrap()
    }

    /// Species, Name, Discriminator, IsFlightless, Group, FoundOn
    fn animal_row(discriminator: &str) -> Vec<Value> {
        vec![
            Value::from("Aquila chrysaetos"),
            Value::from("Golden Eagle"),
            Value::from(discriminator),
            Value::Integer(0),
            Value::Integer(10),
            Value::Null,
        ]
    }

    #[test]
    fn root_only_type_never_consults_discriminator() {
        let model = zoo();
        let mut select = select_for("Country");
        let materializer = create(&model, "Country", &mut select);
        assert!(!materializer.consults_discriminator());
        assert!(select.predicate.is_none());

        let row = vec![Value::Integer(1), Value::from("New Zealand")];
        let entity = materializer.materialize(&ArrayValueReader::new(&row)).unwrap();
        assert!(entity.is("Country"));
        assert_eq!(entity.get("Name"), Some(&Value::from("New Zealand")));
    }

    #[test]
    fn single_subtype_gets_equality_predicate() {
        let model = zoo();
        let mut select = select_for("Animal");
        let materializer = create(&model, "Kiwi", &mut select);
        assert!(!materializer.consults_discriminator());
        assert_eq!(
            select.discriminator_predicate(QuerySourceId(0)),
            Some(&SqlExpr::equals(
                SqlExpr::column("t0", "Discriminator"),
                SqlExpr::Literal(Value::from("Kiwi"))
            ))
        );
    }

    #[test]
    fn every_subtype_dispatches_to_itself() {
        let model = zoo();
        let mut select = select_for("Animal");
        let materializer = create(&model, "Animal", &mut select);
        assert!(materializer.consults_discriminator());
        assert_eq!(select.projection_len(), 6);

        for name in ["Eagle", "Kiwi"] {
            let row = animal_row(name);
            let entity = materializer.materialize(&ArrayValueReader::new(&row)).unwrap();
            assert_eq!(entity.type_name, name);
            assert_eq!(entity.get("IsFlightless"), Some(&Value::Bool(false)));
        }
        let eagle = materializer
            .materialize(&ArrayValueReader::new(&animal_row("Eagle")))
            .unwrap();
        assert_eq!(eagle.values.len(), 6 - 1);
        assert!(eagle.get("FoundOn").is_none());
    }

    #[test]
    fn unknown_discriminator_is_a_discrimination_error() {
        let model = zoo();
        let mut select = select_for("Animal");
        let materializer = create(&model, "Bird", &mut select);
        let row = animal_row("Dodo");
        let err = materializer
            .materialize(&ArrayValueReader::new(&row))
            .unwrap_err();
        match err {
            StorageError::UnableToDiscriminate { entity_type, value } => {
                assert_eq!(entity_type, "Animal");
                assert_eq!(value, "'Dodo'");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn multiple_subtypes_restrict_to_known_values() {
        let model = zoo();
        let mut select = select_for("Animal");
        create(&model, "Bird", &mut select);
        let column = SqlExpr::column("t0", "Discriminator");
        let expected = SqlExpr::equals(column.clone(), SqlExpr::Literal(Value::from("Eagle")))
            .or(SqlExpr::equals(column, SqlExpr::Literal(Value::from("Kiwi"))));
        assert_eq!(select.discriminator_predicate(QuerySourceId(0)), Some(&expected));
    }

    #[test]
    fn filter_only_source_projects_nothing() {
        let model = zoo();
        let eagle = model.entity_type_by_name("Eagle").unwrap().id;
        let mut select = select_for("Animal");
        MaterializerFactory
            .apply_discriminator_filter(
                &model,
                eagle,
                &mut select,
                |p| SqlExpr::column("t0", p.column_name()),
                QuerySourceId(0),
            )
            .unwrap();
        assert_eq!(select.projection_len(), 0);
        assert!(select.discriminator_predicate(QuerySourceId(0)).is_some());

        let country = model.entity_type_by_name("Country").unwrap().id;
        let mut select = select_for("Country");
        MaterializerFactory
            .apply_discriminator_filter(
                &model,
                country,
                &mut select,
                |p| SqlExpr::column("t0", p.column_name()),
                QuerySourceId(0),
            )
            .unwrap();
        assert!(select.predicate.is_none());
    }

    #[test]
    fn materialization_is_idempotent() {
        let model = zoo();
        let mut select = select_for("Country");
        let materializer = create(&model, "Country", &mut select);
        let row = vec![Value::Integer(7), Value::from("Chile")];
        let first = materializer.materialize(&ArrayValueReader::new(&row)).unwrap();
        let second = materializer.materialize(&ArrayValueReader::new(&row)).unwrap();
        assert_eq!(first, second);
    }
}
