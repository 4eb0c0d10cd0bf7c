//! SQL text generation for the relational backend.
//!
//! Renders [`SelectExpr`]s, modification statements, and table DDL as SQLite
//! SQL. Identifiers are always double-quoted. Query parameters become
//! numbered placeholders (`?1`, `?2`, ...) in order of first appearance; a
//! parameter referenced twice reuses its number. Literal constants are part
//! of the query shape and are inlined.

use std::fmt::Write;

use quarry_core::{EntityTypeId, Model, Value};

use crate::error::StorageError;
use crate::select::{SelectExpr, SqlExpr};

/// A rendered query with the parameter names its placeholders bind.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub text: String,
    /// `parameter_names[i]` binds placeholder `?{i + 1}`.
    pub parameter_names: Vec<String>,
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => format!("{:?}", r),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(bytes) => {
            let mut out = String::with_capacity(bytes.len() * 2 + 3);
            out.push_str("X'");
            for b in bytes {
                let _ = write!(out, "{:02X}", b);
            }
            out.push('\'');
            out
        }
    }
}

// ---------------------------------------------------------------------------
// SELECT
// ---------------------------------------------------------------------------

/// Renders a select expression.
pub fn generate_select(select: &SelectExpr) -> GeneratedSql {
    let mut generator = SelectGenerator::default();
    generator.visit_select(select);
    GeneratedSql {
        text: generator.sql,
        parameter_names: generator.parameters,
    }
}

#[derive(Default)]
struct SelectGenerator {
    sql: String,
    parameters: Vec<String>,
}

impl SelectGenerator {
    fn visit_select(&mut self, select: &SelectExpr) {
        self.sql.push_str("SELECT ");
        let mut any = false;
        for (i, column) in select.projection().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.visit_expr(&column.expr);
            if let Some(alias) = &column.alias {
                self.sql.push_str(" AS ");
                self.sql.push_str(&quote_identifier(alias));
            }
            any = true;
        }
        if !any {
            self.sql.push('1');
        }

        self.sql.push_str(" FROM ");
        self.push_table(&select.from.table, &select.from.alias);
        for join in &select.joins {
            self.sql.push_str(" INNER JOIN ");
            self.push_table(&join.table.table, &join.table.alias);
            self.sql.push_str(" ON ");
            self.visit_expr(&join.on);
        }

        if let Some(predicate) = &select.predicate {
            self.sql.push_str(" WHERE ");
            self.visit_expr(predicate);
        }

        if !select.order_by.is_empty() {
            self.sql.push_str(" ORDER BY ");
            for (i, ordering) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.visit_expr(&ordering.expr);
                if ordering.direction == quarry_core::Direction::Descending {
                    self.sql.push_str(" DESC");
                }
            }
        }

        match (select.limit, select.offset) {
            (Some(limit), Some(offset)) => {
                let _ = write!(self.sql, " LIMIT {} OFFSET {}", limit, offset);
            }
            (Some(limit), None) => {
                let _ = write!(self.sql, " LIMIT {}", limit);
            }
            (None, Some(offset)) => {
                let _ = write!(self.sql, " LIMIT -1 OFFSET {}", offset);
            }
            (None, None) => {}
        }
    }

    fn push_table(&mut self, table: &str, alias: &str) {
        self.sql.push_str(&quote_identifier(table));
        self.sql.push_str(" AS ");
        self.sql.push_str(&quote_identifier(alias));
    }

    fn visit_expr(&mut self, expr: &SqlExpr) {
        match expr {
            SqlExpr::Column { table, column } => {
                self.sql.push_str(&quote_identifier(table));
                self.sql.push('.');
                self.sql.push_str(&quote_identifier(column));
            }
            SqlExpr::Literal(value) => self.sql.push_str(&literal(value)),
            SqlExpr::Parameter(name) => {
                let position = match self.parameters.iter().position(|p| p == name) {
                    Some(i) => i + 1,
                    None => {
                        self.parameters.push(name.clone());
                        self.parameters.len()
                    }
                };
                let _ = write!(self.sql, "?{}", position);
            }
            SqlExpr::Compare { op, left, right } => {
                self.visit_expr(left);
                self.sql.push(' ');
                self.sql.push_str(op.sql());
                self.sql.push(' ');
                self.visit_expr(right);
            }
            SqlExpr::And(left, right) => self.visit_binary(left, "AND", right),
            SqlExpr::Or(left, right) => self.visit_binary(left, "OR", right),
            SqlExpr::Not(inner) => {
                self.sql.push_str("NOT (");
                self.visit_expr(inner);
                self.sql.push(')');
            }
            SqlExpr::IsNull(inner) => {
                self.visit_expr(inner);
                self.sql.push_str(" IS NULL");
            }
            SqlExpr::Discriminator { predicate, .. } => self.visit_expr(predicate),
        }
    }

    fn visit_binary(&mut self, left: &SqlExpr, op: &str, right: &SqlExpr) {
        self.sql.push('(');
        self.visit_expr(left);
        self.sql.push(' ');
        self.sql.push_str(op);
        self.sql.push(' ');
        self.visit_expr(right);
        self.sql.push(')');
    }
}

// ---------------------------------------------------------------------------
// Modification statements
// ---------------------------------------------------------------------------

fn placeholders(start: usize, count: usize) -> Vec<String> {
    (start..start + count).map(|i| format!("?{}", i)).collect()
}

/// `INSERT INTO t (c1, c2) VALUES (?1, ?2)`
pub fn generate_insert(table: &str, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        names.join(", "),
        placeholders(1, columns.len()).join(", ")
    )
}

/// `UPDATE t SET c1 = ?1 WHERE k = ?2`; parameters are the written values
/// followed by the key values.
pub fn generate_update(table: &str, columns: &[&str], key_columns: &[&str]) -> String {
    let sets: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_identifier(c), i + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        quote_identifier(table),
        sets.join(", "),
        key_condition(key_columns, columns.len() + 1)
    )
}

/// `DELETE FROM t WHERE k = ?1`
pub fn generate_delete(table: &str, key_columns: &[&str]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_identifier(table),
        key_condition(key_columns, 1)
    )
}

fn key_condition(key_columns: &[&str], start: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_identifier(c), start + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

// ---------------------------------------------------------------------------
// DDL
// ---------------------------------------------------------------------------

/// `CREATE TABLE IF NOT EXISTS` for the hierarchy rooted at `root`.
///
/// Columns declared on the root keep their nullability; columns of derived
/// types are always nullable since other types of the hierarchy share the
/// row. Foreign keys whose principal columns are the principal's key become
/// `FOREIGN KEY` constraints.
pub fn generate_create_table(model: &Model, root: EntityTypeId) -> Result<String, StorageError> {
    let root_type = model.root_type(root)?;
    let root_columns: Vec<&str> = root_type
        .declared_properties
        .iter()
        .map(|p| p.column_name())
        .collect();

    let mut definitions = Vec::new();
    for property in model.table_columns(root)? {
        let mut definition = format!(
            "{} {}",
            quote_identifier(property.column_name()),
            property.value_type.sql_name()
        );
        if !property.nullable && root_columns.contains(&property.column_name()) {
            definition.push_str(" NOT NULL");
        }
        definitions.push(definition);
    }

    let key: Vec<String> = model
        .key_properties(root)?
        .iter()
        .map(|p| quote_identifier(p.column_name()))
        .collect();
    definitions.push(format!("PRIMARY KEY ({})", key.join(", ")));

    for fk in model.foreign_keys() {
        if model.root_type(fk.dependent)?.id != root_type.id {
            continue;
        }
        let principal_key: Vec<&str> = model
            .key_properties(fk.principal)?
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        let principal_names: Vec<&str> = fk.principal_properties.iter().map(String::as_str).collect();
        if principal_key != principal_names {
            continue;
        }
        let dependent_columns = fk
            .dependent_properties
            .iter()
            .map(|name| Ok(quote_identifier(model.property(fk.dependent, name)?.column_name())))
            .collect::<Result<Vec<_>, StorageError>>()?;
        let principal_columns = fk
            .principal_properties
            .iter()
            .map(|name| Ok(quote_identifier(model.property(fk.principal, name)?.column_name())))
            .collect::<Result<Vec<_>, StorageError>>()?;
        definitions.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            dependent_columns.join(", "),
            quote_identifier(model.table_name(fk.principal)?),
            principal_columns.join(", ")
        ));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(model.table_name(root)?),
        definitions.join(", ")
    ))
}
