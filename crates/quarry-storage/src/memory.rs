//! The in-memory backend.
//!
//! [`InMemoryDatabase`] holds one table per hierarchy root, each a map from
//! entity key to row. Rows are immutable `Arc`s, so reads clone pointers
//! rather than values. A save applies all of its commands to copies of the
//! touched tables and swaps them in only if every command succeeded, so a
//! failed save leaves the database untouched.
//!
//! [`InMemoryStore`] compiles queries into the same [`SelectExpr`] the
//! relational backend renders as SQL and evaluates it directly: nested-loop
//! joins, SQL three-valued logic for predicates, ordering with `NULL`s
//! first, then offset and limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use quarry_core::{CompareOp, Direction, EntityKey, EntityState, Model, PendingEntry, QueryModel, Value};
use tokio_util::sync::CancellationToken;

use crate::batch::ModificationCommand;
use crate::cache::CompiledQueryCache;
use crate::compile::translate;
use crate::context::{CompiledQuery, QueryContext, ResultShaper};
use crate::error::StorageError;
use crate::materializer::MaterializerFactory;
use crate::options::StoreOptions;
use crate::select::{SelectExpr, SqlExpr};
use crate::traits::DataStore;

type Row = Arc<IndexMap<String, Value>>;
type Table = IndexMap<EntityKey, Row>;

/// Process-local tables shared by the stores opened on it.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table for every hierarchy root of `model` that has
    /// none yet. Returns `true` if any table was created.
    pub fn ensure_created(&self, model: &Model) -> Result<bool, StorageError> {
        let mut tables = self.tables.write();
        let mut created = false;
        for root in model.root_types() {
            let name = model.table_name(root.id)?;
            if !tables.contains_key(name) {
                tables.insert(name.to_string(), Table::new());
                created = true;
            }
        }
        if created {
            tracing::info!(tables = tables.len(), "created in-memory tables");
        }
        Ok(created)
    }

    /// Drops every table. Returns `true` if there was anything to drop.
    pub fn clear(&self) -> bool {
        let mut tables = self.tables.write();
        let had_tables = !tables.is_empty();
        tables.clear();
        had_tables
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Copy of the rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<IndexMap<String, Value>> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.values().map(|row| row.as_ref().clone()).collect())
            .unwrap_or_default()
    }

    /// Applies `commands` atomically. Returns the number of affected rows.
    pub fn apply(&self, commands: &[ModificationCommand]) -> Result<usize, StorageError> {
        let mut tables = self.tables.write();
        let mut staged: HashMap<&str, Table> = HashMap::new();

        for command in commands {
            let table = staged
                .entry(command.table.as_str())
                .or_insert_with(|| tables.get(&command.table).cloned().unwrap_or_default());
            apply_command(table, command)?;
        }

        for (name, table) in staged {
            tables.insert(name.to_string(), table);
        }
        Ok(commands.len())
    }

    /// Runs `select` against the current tables.
    pub fn evaluate(&self, select: &SelectExpr, context: &QueryContext<'_>) -> Result<Vec<Vec<Value>>, StorageError> {
        let tables = self.tables.read();
        Evaluator { context }.run(&tables, select)
    }
}

fn apply_command(table: &mut Table, command: &ModificationCommand) -> Result<(), StorageError> {
    let missing_row = || StorageError::ConcurrencyConflict {
        operation: format!("{:?}", command.state).to_lowercase(),
        table: command.table.clone(),
        affected: 0,
    };
    match command.state {
        EntityState::Added => {
            if table.contains_key(&command.key) {
                return Err(StorageError::DuplicateKey {
                    table: command.table.clone(),
                    key: format!("{:?}", command.key.values()),
                });
            }
            let row = command
                .write_columns()
                .map(|c| (c.column.clone(), c.value.clone()))
                .collect();
            table.insert(command.key.clone(), Arc::new(row));
        }
        EntityState::Modified => {
            let existing = table.get_mut(&command.key).ok_or_else(missing_row)?;
            let row = Arc::make_mut(existing);
            for column in command.write_columns() {
                row.insert(column.column.clone(), column.value.clone());
            }
        }
        EntityState::Deleted => {
            table.shift_remove(&command.key).ok_or_else(missing_row)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// One candidate result row: the row bound to each table alias.
type Bindings<'r> = Vec<(&'r str, &'r IndexMap<String, Value>)>;

struct Evaluator<'c, 'q> {
    context: &'c QueryContext<'q>,
}

impl Evaluator<'_, '_> {
    fn run(&self, tables: &HashMap<String, Table>, select: &SelectExpr) -> Result<Vec<Vec<Value>>, StorageError> {
        let mut candidates: Vec<Bindings<'_>> = table_rows(tables, &select.from.table)
            .map(|row| vec![(select.from.alias.as_str(), row)])
            .collect();

        for join in &select.joins {
            let mut joined = Vec::new();
            for bindings in &candidates {
                self.context.check_cancelled()?;
                for row in table_rows(tables, &join.table.table) {
                    let mut candidate = bindings.clone();
                    candidate.push((join.table.alias.as_str(), row));
                    if self.holds(&join.on, &candidate)? {
                        joined.push(candidate);
                    }
                }
            }
            candidates = joined;
        }

        if let Some(predicate) = &select.predicate {
            let mut kept = Vec::with_capacity(candidates.len());
            for bindings in candidates {
                if self.holds(predicate, &bindings)? {
                    kept.push(bindings);
                }
            }
            candidates = kept;
        }

        if !select.order_by.is_empty() {
            let mut keyed = candidates
                .into_iter()
                .map(|bindings| {
                    let keys = select
                        .order_by
                        .iter()
                        .map(|o| self.eval(&o.expr, &bindings))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok((keys, bindings))
                })
                .collect::<Result<Vec<_>, StorageError>>()?;
            keyed.sort_by(|(a, _), (b, _)| {
                for ((x, y), ordering) in a.iter().zip(b.iter()).zip(&select.order_by) {
                    let cmp = match ordering.direction {
                        Direction::Ascending => x.sort_cmp(y),
                        Direction::Descending => y.sort_cmp(x),
                    };
                    if cmp.is_ne() {
                        return cmp;
                    }
                }
                std::cmp::Ordering::Equal
            });
            candidates = keyed.into_iter().map(|(_, bindings)| bindings).collect();
        }

        let offset = select.offset.map_or(0, to_usize);
        let limit = select.limit.map_or(usize::MAX, to_usize);
        let projection: Vec<&SqlExpr> = select.projection().map(|a| &a.expr).collect();

        let mut rows = Vec::new();
        for bindings in candidates.iter().skip(offset).take(limit) {
            self.context.check_cancelled()?;
            let row = projection
                .iter()
                .map(|expr| self.eval(expr, bindings))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// `true` only when `predicate` is known to be true.
    fn holds(&self, predicate: &SqlExpr, bindings: &Bindings<'_>) -> Result<bool, StorageError> {
        Ok(truth(&self.eval(predicate, bindings)?) == Some(true))
    }

    fn eval(&self, expr: &SqlExpr, bindings: &Bindings<'_>) -> Result<Value, StorageError> {
        Ok(match expr {
            SqlExpr::Column { table, column } => {
                let (_, row) = bindings
                    .iter()
                    .find(|(alias, _)| alias == table)
                    .ok_or_else(|| StorageError::translation(format!("unknown table alias '{table}'")))?;
                row.get(column).cloned().unwrap_or(Value::Null)
            }
            SqlExpr::Literal(value) => value.clone(),
            SqlExpr::Parameter(name) => self.context.parameter(name)?.clone(),
            SqlExpr::Compare { op, left, right } => {
                let left = self.eval(left, bindings)?;
                let right = self.eval(right, bindings)?;
                from_truth(left.sql_cmp(&right).map(|ord| match op {
                    CompareOp::Eq => ord.is_eq(),
                    CompareOp::Ne => ord.is_ne(),
                    CompareOp::Lt => ord.is_lt(),
                    CompareOp::Le => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Ge => ord.is_ge(),
                }))
            }
            SqlExpr::And(left, right) => {
                let left = truth(&self.eval(left, bindings)?);
                if left == Some(false) {
                    return Ok(Value::Bool(false));
                }
                match (left, truth(&self.eval(right, bindings)?)) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                }
            }
            SqlExpr::Or(left, right) => {
                let left = truth(&self.eval(left, bindings)?);
                if left == Some(true) {
                    return Ok(Value::Bool(true));
                }
                match (left, truth(&self.eval(right, bindings)?)) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                }
            }
            SqlExpr::Not(inner) => from_truth(truth(&self.eval(inner, bindings)?).map(|b| !b)),
            SqlExpr::IsNull(inner) => Value::Bool(self.eval(inner, bindings)?.is_null()),
            SqlExpr::Discriminator { predicate, .. } => self.eval(predicate, bindings)?,
        })
    }
}

fn table_rows<'t>(tables: &'t HashMap<String, Table>, name: &str) -> impl Iterator<Item = &'t IndexMap<String, Value>> {
    tables
        .get(name)
        .into_iter()
        .flat_map(|table| table.values().map(|row| row.as_ref()))
}

/// Boolean reading of a value; `None` is unknown.
fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::Integer(i) => Some(*i != 0),
        Value::Real(r) => Some(*r != 0.0),
        Value::Text(_) | Value::Blob(_) => Some(false),
    }
}

fn from_truth(truth: Option<bool>) -> Value {
    truth.map_or(Value::Null, Value::Bool)
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A compiled in-memory query.
#[derive(Debug)]
pub struct MemoryQuery {
    pub select: SelectExpr,
    shaper: ResultShaper,
}

impl CompiledQuery for MemoryQuery {
    fn shaper(&self) -> &ResultShaper {
        &self.shaper
    }
}

/// A [`DataStore`] over an [`InMemoryDatabase`].
pub struct InMemoryStore {
    name: String,
    model: Arc<Model>,
    database: Arc<InMemoryDatabase>,
    options: StoreOptions,
    cache: CompiledQueryCache<Arc<MemoryQuery>>,
}

impl InMemoryStore {
    /// A store over a private, empty database.
    pub fn new(name: &str, model: Arc<Model>, options: StoreOptions) -> Self {
        Self::with_database(name, model, Arc::new(InMemoryDatabase::new()), options)
    }

    /// A store over `database`, shared with other stores unless
    /// `persist_in_memory` is off, in which case the store starts from a
    /// private, empty database instead.
    pub fn with_database(
        name: &str,
        model: Arc<Model>,
        database: Arc<InMemoryDatabase>,
        options: StoreOptions,
    ) -> Self {
        let database = if options.persist_in_memory {
            database
        } else {
            Arc::new(InMemoryDatabase::new())
        };
        InMemoryStore {
            name: name.to_string(),
            model,
            database,
            options,
            cache: CompiledQueryCache::new(),
        }
    }

    pub fn database(&self) -> &Arc<InMemoryDatabase> {
        &self.database
    }

    /// Creates the tables of the model. Returns `true` if any was created.
    pub fn ensure_database_created(&self) -> Result<bool, StorageError> {
        self.database.ensure_created(&self.model)
    }

    /// Drops all tables. Returns `true` if any existed.
    pub fn ensure_database_deleted(&self) -> bool {
        self.database.clear()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    type Compiled = MemoryQuery;

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn compiled_query_cache(&self) -> &CompiledQueryCache<Arc<MemoryQuery>> {
        &self.cache
    }

    fn compile_query(&self, query: &QueryModel) -> Result<MemoryQuery, StorageError> {
        let translation = translate(&self.model, &MaterializerFactory, query)?;
        tracing::debug!(store = %self.name, "compiled in-memory query");
        Ok(MemoryQuery {
            select: translation.select,
            shaper: translation.shaper,
        })
    }

    fn execute_query(
        &self,
        compiled: &MemoryQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        context.check_cancelled()?;
        self.database.evaluate(&compiled.select, context)
    }

    async fn execute_query_async(
        &self,
        compiled: &MemoryQuery,
        context: &QueryContext<'_>,
    ) -> Result<Vec<Vec<Value>>, StorageError> {
        self.execute_query(compiled, context)
    }

    fn save_entries(&self, entries: &[PendingEntry]) -> Result<usize, StorageError> {
        let commands = entries
            .iter()
            .map(|entry| ModificationCommand::from_entry(&self.model, entry))
            .collect::<Result<Vec<_>, _>>()?;
        self.database.apply(&commands)
    }

    async fn save_entries_async(
        &self,
        entries: &[PendingEntry],
        cancellation: &CancellationToken,
    ) -> Result<usize, StorageError> {
        if cancellation.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.save_entries(entries)
    }
}
