//! Modification commands and dependency-ordered command batches.
//!
//! [`ModificationCommand::from_entry`] turns one [`PendingEntry`] into the
//! column writes and key of one `INSERT`, `UPDATE`, or `DELETE`.
//! [`CommandBatchPreparer::batch_commands`] orders the commands of a save by
//! foreign-key dependencies and groups them into [`CommandBatch`]es:
//!
//! - an added principal is inserted before any added or modified dependent
//!   that references it;
//! - a deleted or re-pointed dependent is written before the principal it
//!   referenced is deleted.
//!
//! Dependencies form a DAG over the commands (a petgraph `DiGraph`). Each
//! command's batch level is the length of the longest dependency chain
//! leading to it, so every command lands in a strictly later batch than
//! everything it depends on. Commands of one level keep entry order and are
//! split into batches of at most `max_batch_size`. A cycle is reported as
//! [`StorageError::CircularDependency`].

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use quarry_core::{EntityKey, EntityState, EntityTypeId, Model, PendingEntry, Value, ValueType};
use smallvec::SmallVec;

use crate::error::StorageError;
use crate::options::StoreOptions;
use crate::sql::{generate_delete, generate_insert, generate_update};

/// One column touched by a command.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    pub property: String,
    pub column: String,
    pub value: Value,
    pub is_key: bool,
    pub is_write: bool,
}

/// A single-row insert, update, or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationCommand {
    pub entity_type: EntityTypeId,
    pub table: String,
    pub state: EntityState,
    pub key: EntityKey,
    pub columns: Vec<ColumnModification>,
}

fn invalid_entry(reason: impl Into<String>) -> StorageError {
    StorageError::invalid_argument("entries", reason)
}

impl ModificationCommand {
    /// Builds the command for `entry`, validating it against `model`.
    pub fn from_entry(model: &Model, entry: &PendingEntry) -> Result<Self, StorageError> {
        let entity_type = model
            .entity_type(entry.entity_type)
            .map_err(|e| invalid_entry(e.to_string()))?;
        if entity_type.is_abstract {
            return Err(invalid_entry(format!(
                "cannot save an instance of abstract type '{}'",
                entity_type.name
            )));
        }
        let key = entry
            .key(model)
            .map_err(|e| invalid_entry(format!("missing key value: {}", e)))?;
        if key.values().iter().any(Value::is_null) {
            return Err(invalid_entry(format!(
                "key of '{}' entity contains NULL",
                entity_type.name
            )));
        }

        let properties = model.properties(entity_type.id)?;
        let key_names: Vec<&str> = model
            .key_properties(entity_type.id)?
            .into_iter()
            .map(|p| p.name.as_str())
            .collect();
        let discriminator = model.discriminator_property(entity_type.id)?;

        for name in entry.current.keys() {
            if !properties.iter().any(|p| &p.name == name) {
                return Err(invalid_entry(format!(
                    "'{}' has no property '{}'",
                    entity_type.name, name
                )));
            }
        }

        let coerce = |name: &str, value: Value, value_type: ValueType| {
            value
                .coerce(value_type)
                .map_err(|e| invalid_entry(format!("property '{}': {}", name, e)))
        };

        let mut columns = Vec::new();
        match entry.state {
            EntityState::Added => {
                for property in &properties {
                    let is_discriminator = discriminator.is_some_and(|d| d.name == property.name);
                    let value = match entry.current.get(&property.name) {
                        Some(value) => value.clone(),
                        None if is_discriminator => {
                            entity_type.discriminator_value.clone().unwrap_or(Value::Null)
                        }
                        None => Value::Null,
                    };
                    if value.is_null() && !property.nullable {
                        return Err(invalid_entry(format!(
                            "required property '{}' of '{}' is NULL",
                            property.name, entity_type.name
                        )));
                    }
                    columns.push(ColumnModification {
                        property: property.name.clone(),
                        column: property.column_name().to_string(),
                        value: coerce(&property.name, value, property.value_type)?,
                        is_key: key_names.contains(&property.name.as_str()),
                        is_write: true,
                    });
                }
            }
            EntityState::Modified => {
                for property in &properties {
                    let is_key = key_names.contains(&property.name.as_str());
                    if is_key {
                        if let (Some(current), Some(original)) = (
                            entry.current.get(&property.name),
                            entry.original.get(&property.name),
                        ) {
                            if current != original {
                                return Err(invalid_entry(format!(
                                    "key property '{}' of a modified '{}' cannot change",
                                    property.name, entity_type.name
                                )));
                            }
                        }
                        let value = entry.identifying_value(&property.name).cloned().unwrap_or(Value::Null);
                        columns.push(ColumnModification {
                            property: property.name.clone(),
                            column: property.column_name().to_string(),
                            value: coerce(&property.name, value, property.value_type)?,
                            is_key: true,
                            is_write: false,
                        });
                        continue;
                    }
                    let Some(current) = entry.current.get(&property.name) else {
                        continue;
                    };
                    let changed = entry.original.get(&property.name) != Some(current);
                    if current.is_null() && !property.nullable {
                        return Err(invalid_entry(format!(
                            "required property '{}' of '{}' is NULL",
                            property.name, entity_type.name
                        )));
                    }
                    columns.push(ColumnModification {
                        property: property.name.clone(),
                        column: property.column_name().to_string(),
                        value: coerce(&property.name, current.clone(), property.value_type)?,
                        is_key: false,
                        is_write: changed,
                    });
                }
                // Nothing changed: write every supplied value, or the key
                // itself, so the row is still checked for existence.
                if !columns.iter().any(|c| c.is_write) {
                    let has_non_key = columns.iter().any(|c| !c.is_key);
                    for column in columns.iter_mut() {
                        column.is_write = if has_non_key { !column.is_key } else { true };
                    }
                }
            }
            EntityState::Deleted => {
                for property in &properties {
                    if !key_names.contains(&property.name.as_str()) {
                        continue;
                    }
                    let value = entry.identifying_value(&property.name).cloned().unwrap_or(Value::Null);
                    columns.push(ColumnModification {
                        property: property.name.clone(),
                        column: property.column_name().to_string(),
                        value: coerce(&property.name, value, property.value_type)?,
                        is_key: true,
                        is_write: false,
                    });
                }
            }
        }

        Ok(ModificationCommand {
            entity_type: entity_type.id,
            table: model.table_name(entity_type.id)?.to_string(),
            state: entry.state,
            key,
            columns,
        })
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_key)
    }

    pub fn write_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_write)
    }

    /// The statement text and its parameter values.
    pub fn sql(&self) -> (String, Vec<Value>) {
        let writes: Vec<&ColumnModification> = self.write_columns().collect();
        let keys: Vec<&ColumnModification> = self.key_columns().collect();
        fn names<'a>(cols: &[&'a ColumnModification]) -> Vec<&'a str> {
            cols.iter().map(|c| c.column.as_str()).collect()
        }
        fn values(cols: &[&ColumnModification]) -> Vec<Value> {
            cols.iter().map(|c| c.value.clone()).collect()
        }
        match self.state {
            EntityState::Added => (generate_insert(&self.table, &names(&writes)), values(&writes)),
            EntityState::Modified => {
                let mut params = values(&writes);
                params.extend(values(&keys));
                (generate_update(&self.table, &names(&writes), &names(&keys)), params)
            }
            EntityState::Deleted => (generate_delete(&self.table, &names(&keys)), values(&keys)),
        }
    }

    /// `true` for commands that must affect exactly one existing row.
    pub fn requires_existing_row(&self) -> bool {
        matches!(self.state, EntityState::Modified | EntityState::Deleted)
    }
}

/// Commands sent to the backend together.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandBatch {
    pub commands: Vec<ModificationCommand>,
}

impl CommandBatch {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Orders and groups pending entries into batches.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandBatchPreparer;

impl CommandBatchPreparer {
    pub fn batch_commands(
        &self,
        model: &Model,
        entries: &[PendingEntry],
        options: &StoreOptions,
    ) -> Result<Vec<CommandBatch>, StorageError> {
        let commands = entries
            .iter()
            .map(|entry| ModificationCommand::from_entry(model, entry))
            .collect::<Result<Vec<_>, _>>()?;

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(commands.len(), 0);
        let nodes: Vec<NodeIndex> = (0..commands.len()).map(|i| graph.add_node(i)).collect();
        add_foreign_key_edges(model, entries, &nodes, &mut graph)?;

        let order = toposort(&graph, None).map_err(|cycle| StorageError::CircularDependency {
            reason: format!(
                "entry {} participates in a foreign key cycle",
                graph[cycle.node_id()]
            ),
        })?;

        let mut levels = vec![0usize; commands.len()];
        for node in &order {
            let level = graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|pred| levels[graph[pred]] + 1)
                .max()
                .unwrap_or(0);
            levels[graph[*node]] = level;
        }

        let mut by_level: BTreeMap<usize, Vec<ModificationCommand>> = BTreeMap::new();
        for (index, command) in commands.into_iter().enumerate() {
            by_level.entry(levels[index]).or_default().push(command);
        }

        let max = options.max_batch_size.max(1);
        let mut batches = Vec::new();
        for (_, level) in by_level {
            let mut level = level.into_iter().peekable();
            while level.peek().is_some() {
                batches.push(CommandBatch {
                    commands: level.by_ref().take(max).collect(),
                });
            }
        }
        Ok(batches)
    }
}

/// Values of `properties` on `values`, coerced to the principal's types.
/// `None` if any is missing or `NULL`.
fn fk_values(
    values: &indexmap::IndexMap<String, Value>,
    properties: &[String],
    types: &[ValueType],
) -> Option<EntityKey> {
    let mut key = SmallVec::new();
    for (name, value_type) in properties.iter().zip(types) {
        let value = values.get(name)?;
        if value.is_null() {
            return None;
        }
        key.push(value.clone().coerce(*value_type).ok()?);
    }
    Some(EntityKey(key))
}

fn add_foreign_key_edges(
    model: &Model,
    entries: &[PendingEntry],
    nodes: &[NodeIndex],
    graph: &mut DiGraph<usize, ()>,
) -> Result<(), StorageError> {
    for fk in model.foreign_keys() {
        let types = fk
            .principal_properties
            .iter()
            .map(|name| Ok(model.property(fk.principal, name)?.value_type))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let mut added: HashMap<EntityKey, Vec<usize>> = HashMap::new();
        let mut deleted: HashMap<EntityKey, Vec<usize>> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if !model.is_assignable_to(entry.entity_type, fk.principal)? {
                continue;
            }
            match entry.state {
                EntityState::Added => {
                    if let Some(key) = fk_values(&entry.current, &fk.principal_properties, &types) {
                        added.entry(key).or_default().push(index);
                    }
                }
                EntityState::Deleted => {
                    if let Some(key) = fk_values(&entry.original, &fk.principal_properties, &types) {
                        deleted.entry(key).or_default().push(index);
                    }
                }
                EntityState::Modified => {}
            }
        }
        if added.is_empty() && deleted.is_empty() {
            continue;
        }

        for (index, entry) in entries.iter().enumerate() {
            if !model.is_assignable_to(entry.entity_type, fk.dependent)? {
                continue;
            }
            if matches!(entry.state, EntityState::Added | EntityState::Modified) {
                let mut current = entry.original.clone();
                current.extend(entry.current.iter().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(key) = fk_values(&current, &fk.dependent_properties, &types) {
                    for &principal in added.get(&key).into_iter().flatten() {
                        if principal != index {
                            graph.update_edge(nodes[principal], nodes[index], ());
                        }
                    }
                }
            }
            if matches!(entry.state, EntityState::Deleted | EntityState::Modified) {
                if let Some(key) = fk_values(&entry.original, &fk.dependent_properties, &types) {
                    for &principal in deleted.get(&key).into_iter().flatten() {
                        if principal != index {
                            graph.update_edge(nodes[index], nodes[principal], ());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
