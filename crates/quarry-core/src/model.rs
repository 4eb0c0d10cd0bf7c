//! Immutable entity metadata: types, properties, hierarchies, foreign keys.
//!
//! A [`Model`] is built once from [`EntityTypeDef`]s and [`ForeignKeyDef`]s
//! (in code or from JSON) and then only read. Every [`EntityType`] has a
//! stable [`EntityTypeId`] providing O(1) lookup.
//!
//! # Hierarchies
//!
//! Entity types form single-table hierarchies. A root type owns the table
//! name, the key, and (when the hierarchy has more than one type) the
//! discriminator property. Derived types add properties and carry a
//! discriminator value when they are concrete. All types of one hierarchy
//! share the root's table; [`Model::table_columns`] gives the physical layout.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::EntityTypeId;
use crate::value::{Value, ValueType};

/// A scalar property of an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    /// Column name in the hierarchy's table; defaults to `name`.
    #[serde(default)]
    pub column: Option<String>,
    pub value_type: ValueType,
    #[serde(default)]
    pub nullable: bool,
}

impl Property {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Property {
            name: name.to_string(),
            column: None,
            value_type,
            nullable: false,
        }
    }

    /// Marks the property as accepting `Null`.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Maps the property to a column with a different name.
    pub fn with_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

/// Definition of an entity type, the input to [`Model::add_entity_type`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    /// Name of the base type. Must already be registered.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub properties: Vec<Property>,
    /// Key property names. Roots only.
    #[serde(default)]
    pub key: Vec<String>,
    /// Table name. Roots only; defaults to the type name.
    #[serde(default)]
    pub table: Option<String>,
    /// Discriminator property name. Roots only.
    #[serde(default)]
    pub discriminator_property: Option<String>,
    #[serde(default)]
    pub discriminator_value: Option<Value>,
}

impl EntityTypeDef {
    pub fn new(name: &str) -> Self {
        EntityTypeDef {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn derives(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn key(mut self, names: &[&str]) -> Self {
        self.key = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn discriminator(mut self, property: &str) -> Self {
        self.discriminator_property = Some(property.to_string());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }
}

/// A registered entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub name: String,
    pub base: Option<EntityTypeId>,
    pub is_abstract: bool,
    /// Properties declared on this type only (not inherited ones).
    pub declared_properties: Vec<Property>,
    pub key: Vec<String>,
    pub table: Option<String>,
    pub discriminator_property: Option<String>,
    pub discriminator_value: Option<Value>,
}

impl EntityType {
    pub fn is_root(&self) -> bool {
        self.base.is_none()
    }
}

/// Definition of a foreign key, referencing entity types by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub dependent: String,
    pub principal: String,
    pub dependent_properties: Vec<String>,
    pub principal_properties: Vec<String>,
}

/// A reference from rows of `dependent` to rows of `principal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub dependent: EntityTypeId,
    pub principal: EntityTypeId,
    pub dependent_properties: Vec<String>,
    pub principal_properties: Vec<String>,
}

/// Serialized form of a [`Model`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDef {
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

/// The entity metadata graph.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "ModelDef")]
pub struct Model {
    /// Entity types indexed by EntityTypeId.0
    entity_types: Vec<EntityType>,
    /// Name lookup
    names: HashMap<String, EntityTypeId>,
    foreign_keys: Vec<ForeignKey>,
}

impl Model {
    pub fn new() -> Self {
        Model {
            entity_types: Vec::new(),
            names: HashMap::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Builds and validates a model from its serialized form.
    pub fn from_def(def: ModelDef) -> Result<Self, CoreError> {
        let mut model = Model::new();
        for entity_type in def.entity_types {
            model.add_entity_type(entity_type)?;
        }
        for fk in def.foreign_keys {
            model.add_foreign_key(fk)?;
        }
        model.validate()?;
        Ok(model)
    }

    // -------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------

    /// Registers an entity type and returns its new [`EntityTypeId`].
    ///
    /// The base type, if any, must already be registered. Root-only settings
    /// (key, table, discriminator property) are rejected on derived types.
    pub fn add_entity_type(&mut self, def: EntityTypeDef) -> Result<EntityTypeId, CoreError> {
        if self.names.contains_key(&def.name) {
            return Err(CoreError::DuplicateEntityType { name: def.name });
        }

        let base = match &def.base {
            Some(base_name) => Some(self.entity_type_by_name(base_name)?.id),
            None => None,
        };

        if let Some(base_id) = base {
            if !def.key.is_empty() || def.table.is_some() || def.discriminator_property.is_some() {
                return Err(CoreError::InvalidHierarchy {
                    root: self.root_type(base_id)?.name.clone(),
                    reason: format!(
                        "derived type '{}' cannot declare a key, table, or discriminator property",
                        def.name
                    ),
                });
            }
            let inherited: HashSet<&str> = self
                .properties(base_id)?
                .iter()
                .map(|p| p.name.as_str())
                .collect();
            if let Some(dup) = def.properties.iter().find(|p| inherited.contains(p.name.as_str())) {
                return Err(CoreError::InvalidHierarchy {
                    root: self.root_type(base_id)?.name.clone(),
                    reason: format!("'{}' redeclares inherited property '{}'", def.name, dup.name),
                });
            }
        }

        let id = EntityTypeId(self.entity_types.len() as u32);
        self.names.insert(def.name.clone(), id);
        self.entity_types.push(EntityType {
            id,
            name: def.name,
            base,
            is_abstract: def.is_abstract,
            declared_properties: def.properties,
            key: def.key,
            table: def.table,
            discriminator_property: def.discriminator_property,
            discriminator_value: def.discriminator_value,
        });
        Ok(id)
    }

    /// Registers a foreign key between two registered entity types.
    pub fn add_foreign_key(&mut self, def: ForeignKeyDef) -> Result<(), CoreError> {
        let dependent = self.entity_type_by_name(&def.dependent)?.id;
        let principal = self.entity_type_by_name(&def.principal)?.id;
        for name in &def.dependent_properties {
            self.property(dependent, name)?;
        }
        for name in &def.principal_properties {
            self.property(principal, name)?;
        }
        self.foreign_keys.push(ForeignKey {
            dependent,
            principal,
            dependent_properties: def.dependent_properties,
            principal_properties: def.principal_properties,
        });
        Ok(())
    }

    // -------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------

    pub fn entity_type(&self, id: EntityTypeId) -> Result<&EntityType, CoreError> {
        self.entity_types
            .get(id.0 as usize)
            .ok_or(CoreError::EntityTypeNotFound { id })
    }

    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.names
            .get(name)
            .and_then(|id| self.entity_types.get(id.0 as usize))
    }

    pub fn entity_type_by_name(&self, name: &str) -> Result<&EntityType, CoreError> {
        self.find_entity_type(name)
            .ok_or_else(|| CoreError::EntityTypeNameNotFound {
                name: name.to_string(),
            })
    }

    /// All entity types in registration order.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entity_types.iter()
    }

    /// Root types in registration order; one table each.
    pub fn root_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entity_types.iter().filter(|t| t.is_root())
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    // -------------------------------------------------------------------
    // Hierarchy queries
    // -------------------------------------------------------------------

    /// Returns the type chain from the root down to `id` (inclusive).
    pub fn base_chain(&self, id: EntityTypeId) -> Result<Vec<&EntityType>, CoreError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let ty = self.entity_type(cur)?;
            chain.push(ty);
            current = ty.base;
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn root_type(&self, id: EntityTypeId) -> Result<&EntityType, CoreError> {
        let mut ty = self.entity_type(id)?;
        while let Some(base) = ty.base {
            ty = self.entity_type(base)?;
        }
        Ok(ty)
    }

    /// Returns `true` if `id` is `ancestor` or derives from it.
    pub fn is_assignable_to(&self, id: EntityTypeId, ancestor: EntityTypeId) -> Result<bool, CoreError> {
        Ok(self.base_chain(id)?.iter().any(|t| t.id == ancestor))
    }

    /// Direct subtypes of `id`, in registration order.
    pub fn derived_types(&self, id: EntityTypeId) -> impl Iterator<Item = &EntityType> {
        self.entity_types.iter().filter(move |t| t.base == Some(id))
    }

    /// `id` and all of its descendants in pre-order.
    pub fn hierarchy(&self, id: EntityTypeId) -> Result<Vec<&EntityType>, CoreError> {
        let mut out = Vec::new();
        let mut stack = vec![self.entity_type(id)?];
        while let Some(ty) = stack.pop() {
            out.push(ty);
            let mut children: Vec<&EntityType> = self.derived_types(ty.id).collect();
            children.reverse();
            stack.extend(children);
        }
        Ok(out)
    }

    /// `id` and its descendants that can be instantiated, in pre-order.
    pub fn concrete_types_in_hierarchy(&self, id: EntityTypeId) -> Result<Vec<&EntityType>, CoreError> {
        Ok(self
            .hierarchy(id)?
            .into_iter()
            .filter(|t| !t.is_abstract)
            .collect())
    }

    /// All properties of `id`: inherited ones first (root to leaf), then
    /// declared ones.
    pub fn properties(&self, id: EntityTypeId) -> Result<Vec<&Property>, CoreError> {
        Ok(self
            .base_chain(id)?
            .into_iter()
            .flat_map(|t| t.declared_properties.iter())
            .collect())
    }

    pub fn property(&self, id: EntityTypeId, name: &str) -> Result<&Property, CoreError> {
        self.properties(id)?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CoreError::PropertyNotFound {
                entity_type: self
                    .entity_type(id)
                    .map(|t| t.name.clone())
                    .unwrap_or_default(),
                property: name.to_string(),
            })
    }

    /// Key properties, declared on the root.
    pub fn key_properties(&self, id: EntityTypeId) -> Result<Vec<&Property>, CoreError> {
        let root = self.root_type(id)?;
        root.key
            .iter()
            .map(|name| self.property(root.id, name))
            .collect()
    }

    /// The discriminator property of the hierarchy containing `id`, if any.
    pub fn discriminator_property(&self, id: EntityTypeId) -> Result<Option<&Property>, CoreError> {
        let root = self.root_type(id)?;
        match &root.discriminator_property {
            Some(name) => Ok(Some(self.property(root.id, name)?)),
            None => Ok(None),
        }
    }

    /// Table shared by the hierarchy containing `id`.
    pub fn table_name(&self, id: EntityTypeId) -> Result<&str, CoreError> {
        let root = self.root_type(id)?;
        Ok(root.table.as_deref().unwrap_or(&root.name))
    }

    /// Physical column layout of the hierarchy containing `id`: every
    /// property of every type, deduplicated by column name, first
    /// declaration wins.
    pub fn table_columns(&self, id: EntityTypeId) -> Result<Vec<&Property>, CoreError> {
        let root = self.root_type(id)?;
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for ty in self.hierarchy(root.id)? {
            for property in &ty.declared_properties {
                if seen.insert(property.column_name()) {
                    columns.push(property);
                }
            }
        }
        Ok(columns)
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    /// Checks keys and discriminator configuration of every hierarchy.
    pub fn validate(&self) -> Result<(), CoreError> {
        for root in self.root_types() {
            let invalid = |reason: String| CoreError::InvalidHierarchy {
                root: root.name.clone(),
                reason,
            };

            if root.key.is_empty() {
                return Err(invalid("root type declares no key".to_string()));
            }
            for name in &root.key {
                self.property(root.id, name)?;
            }

            let hierarchy = self.hierarchy(root.id)?;
            let discriminator = self.discriminator_property(root.id)?;
            if hierarchy.len() > 1 && discriminator.is_none() {
                return Err(invalid(
                    "hierarchy with derived types requires a discriminator property".to_string(),
                ));
            }
            let Some(discriminator) = discriminator else {
                continue;
            };
            if !matches!(
                discriminator.value_type,
                ValueType::Text | ValueType::Integer | ValueType::Bool
            ) {
                return Err(invalid(format!(
                    "discriminator property '{}' must be text or integer",
                    discriminator.name
                )));
            }

            let mut seen = HashSet::new();
            for ty in hierarchy.iter().filter(|t| !t.is_abstract) {
                let value = ty.discriminator_value.as_ref().ok_or_else(|| {
                    invalid(format!("concrete type '{}' has no discriminator value", ty.name))
                })?;
                let key = value.discriminator_key().ok_or_else(|| {
                    invalid(format!(
                        "discriminator value {} of '{}' must be text or integer",
                        value, ty.name
                    ))
                })?;
                value.clone().coerce(discriminator.value_type)?;
                if !seen.insert(key) {
                    return Err(CoreError::DuplicateDiscriminator {
                        root: root.name.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl TryFrom<ModelDef> for Model {
    type Error = CoreError;

    fn try_from(def: ModelDef) -> Result<Self, Self::Error> {
        Model::from_def(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Animal (abstract) -> Bird (abstract) -> Eagle, Kiwi; Country stands alone.
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
                    .property(Property::new("CountryId", ValueType::Integer))
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

    #[test]
    fn properties_are_inherited_first() {
        let model = zoo();
        let eagle = model.entity_type_by_name("Eagle").unwrap().id;
        let names: Vec<&str> = model
            .properties(eagle)
            .unwrap()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["Species", "Name", "CountryId", "Discriminator", "IsFlightless", "Group"]
        );
    }

    #[test]
    fn concrete_types_skip_abstract_ones() {
        let model = zoo();
        let animal = model.entity_type_by_name("Animal").unwrap().id;
        let names: Vec<&str> = model
            .concrete_types_in_hierarchy(animal)
            .unwrap()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["Eagle", "Kiwi"]);
    }

    #[test]
    fn table_columns_union_the_hierarchy() {
        let model = zoo();
        let kiwi = model.entity_type_by_name("Kiwi").unwrap().id;
        assert_eq!(model.table_name(kiwi).unwrap(), "Animal");
        let columns: Vec<&str> = model
            .table_columns(kiwi)
            .unwrap()
            .iter()
            .map(|p| p.column_name())
            .collect();
        assert_eq!(
            columns,
            vec!["Species", "Name", "CountryId", "Discriminator", "IsFlightless", "Group", "FoundOn"]
        );
    }

    #[test]
    fn zoo_validates() {
        zoo().validate().unwrap();
    }

    #[test]
    fn duplicate_discriminator_rejected() {
        let mut model = zoo();
        model
            .add_entity_type(
                EntityTypeDef::new("Hawk")
                    .derives("Bird")
                    .discriminator_value("Eagle"),
            )
            .unwrap();
        let err = model.validate().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateDiscriminator { .. }));
    }

    #[test]
    fn missing_discriminator_value_rejected() {
        let mut model = zoo();
        model
            .add_entity_type(EntityTypeDef::new("Penguin").derives("Bird"))
            .unwrap();
        assert!(matches!(
            model.validate().unwrap_err(),
            CoreError::InvalidHierarchy { .. }
        ));
    }

    #[test]
    fn derived_type_cannot_declare_key() {
        let mut model = zoo();
        let err = model
            .add_entity_type(EntityTypeDef::new("Owl").derives("Bird").key(&["Name"]))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidHierarchy { .. }));
    }

    #[test]
    fn redeclared_property_rejected() {
        let mut model = zoo();
        let err = model
            .add_entity_type(
                EntityTypeDef::new("Owl")
                    .derives("Bird")
                    .property(Property::new("Name", ValueType::Text)),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidHierarchy { .. }));
    }

    #[test]
    fn model_from_json() {
        let json = r#"{
            "entity_types": [
                { "name": "Blog", "key": ["Url"],
                  "properties": [
                      { "name": "Url", "value_type": "Text" },
                      { "name": "Name", "value_type": "Text", "nullable": true }
                  ] }
            ]
        }"#;
        let model: Model = serde_json::from_str(json).unwrap();
        let blog = model.entity_type_by_name("Blog").unwrap();
        assert!(blog.is_root());
        assert_eq!(model.key_properties(blog.id).unwrap()[0].name, "Url");
    }
}
