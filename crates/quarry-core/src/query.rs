//! The logical, provider-agnostic query model.
//!
//! A [`QueryModel`] names one or more entity-typed [`QuerySource`]s, an
//! optional filter, ordering, paging, and a [`Selector`] describing the
//! result shape. Literal values that vary between executions belong in
//! [`QueryModel::parameters`] and are referenced with [`Expr::Parameter`];
//! everything else is the query's shape.
//!
//! The model is plain data and serializes deterministically (no `HashMap`
//! anywhere), which the storage layer relies on for fingerprinting.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{EntityTypeId, QuerySourceId};
use crate::value::Value;

/// An entity-typed source of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySource {
    pub id: QuerySourceId,
    pub entity_type: EntityTypeId,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A scalar or boolean expression over query sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Property {
        source: QuerySourceId,
        property: String,
    },
    Constant(Value),
    Parameter(String),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

impl Expr {
    pub fn property(source: QuerySourceId, property: &str) -> Self {
        Expr::Property {
            source,
            property: property.to_string(),
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn parameter(name: &str) -> Self {
        Expr::Parameter(name.to_string())
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(left: Expr, right: Expr) -> Self {
        Expr::compare(CompareOp::Eq, left, right)
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }
}

/// Sort direction for one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ordering {
    pub expr: Expr,
    pub direction: Direction,
}

/// Inner equi-join of a new source against an already-introduced one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    pub source: QuerySource,
    /// Property of an earlier source.
    pub outer_key: Expr,
    /// Property name on `source`.
    pub inner_key: String,
}

/// Result shape of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    /// One entity per row.
    Entity(QuerySourceId),
    /// One entity per listed source per row.
    Entities(Vec<QuerySourceId>),
    /// Scalar values per row.
    Properties(Vec<Expr>),
}

/// A complete logical query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryModel {
    pub from: QuerySource,
    #[serde(default)]
    pub joins: Vec<JoinClause>,
    #[serde(default)]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub order_by: Vec<Ordering>,
    #[serde(default)]
    pub skip: Option<u64>,
    #[serde(default)]
    pub take: Option<u64>,
    pub selector: Selector,
    /// Values for [`Expr::Parameter`] references. Not part of the shape.
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
}

impl QueryModel {
    /// Starts a query that selects every entity of `entity_type`
    /// (including subtypes) through source `QuerySourceId(0)`.
    pub fn entities(entity_type: EntityTypeId) -> Self {
        let from = QuerySource {
            id: QuerySourceId(0),
            entity_type,
        };
        QueryModel {
            selector: Selector::Entity(from.id),
            from,
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            skip: None,
            take: None,
            parameters: IndexMap::new(),
        }
    }

    /// Source id of the `FROM` item.
    pub fn root_source(&self) -> QuerySourceId {
        self.from.id
    }

    /// Adds a filter, combined with any existing one via `AND`.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn order_by(mut self, expr: Expr, direction: Direction) -> Self {
        self.order_by.push(Ordering { expr, direction });
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: u64) -> Self {
        self.take = Some(n);
        self
    }

    /// Joins `entity_type` as a new source whose `inner_key` equals
    /// `outer_key`. Returns the query and the new source's id.
    pub fn join(
        mut self,
        entity_type: EntityTypeId,
        outer_key: Expr,
        inner_key: &str,
    ) -> (Self, QuerySourceId) {
        let id = QuerySourceId(self.joins.len() as u32 + 1);
        self.joins.push(JoinClause {
            source: QuerySource { id, entity_type },
            outer_key,
            inner_key: inner_key.to_string(),
        });
        (self, id)
    }

    pub fn select(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    /// All sources, `FROM` first then joins in order.
    pub fn sources(&self) -> impl Iterator<Item = &QuerySource> {
        std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.source))
    }

    pub fn source(&self, id: QuerySourceId) -> Result<&QuerySource, CoreError> {
        self.sources()
            .find(|s| s.id == id)
            .ok_or(CoreError::QuerySourceNotFound { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_combine_with_and() {
        let q = QueryModel::entities(EntityTypeId(0))
            .filter(Expr::equals(Expr::property(QuerySourceId(0), "A"), Expr::constant(1)))
            .filter(Expr::property(QuerySourceId(0), "B").is_null());
        assert!(matches!(q.filter, Some(Expr::And(_, _))));
    }

    #[test]
    fn join_allocates_new_source() {
        let (q, id) = QueryModel::entities(EntityTypeId(0)).join(
            EntityTypeId(1),
            Expr::property(QuerySourceId(0), "CountryId"),
            "Id",
        );
        assert_eq!(id, QuerySourceId(1));
        assert_eq!(q.sources().count(), 2);
        assert!(q.source(id).is_ok());
        assert!(q.source(QuerySourceId(9)).is_err());
    }
}
