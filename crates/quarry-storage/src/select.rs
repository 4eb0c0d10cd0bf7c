//! Relational select AST shared by both backends.
//!
//! A [`SelectExpr`] is the translated form of a query: tables with aliases,
//! inner joins, a projection list of [`AliasExpr`]s, a predicate, ordering,
//! and paging. The relational backend renders it to SQL (see [`crate::sql`]);
//! the in-memory backend evaluates it directly.
//!
//! # Projection
//!
//! Columns are added through [`SelectExpr::add_to_projection`], which returns
//! the position the column will occupy in every result row. Adding the same
//! column twice returns the existing position. Columns needed only by the
//! predicate are added with [`SelectExpr::add_filter_column`]; they are not
//! projected and do not take a position.
//!
//! # Discriminator predicates
//!
//! Each query source may carry one discriminator predicate, wrapped in
//! [`SqlExpr::Discriminator`]. [`SelectExpr::set_discriminator_predicate`]
//! replaces the predicate of the same source if present and otherwise `AND`s
//! it onto the existing predicate, so predicates of different sources never
//! interfere.

use quarry_core::{CompareOp, Direction, QuerySourceId, Value};

/// A table reference with its alias.
#[derive(Debug, Clone, PartialEq)]
pub struct TableExpr {
    pub table: String,
    pub alias: String,
    pub source: QuerySourceId,
}

/// A scalar or boolean expression over aliased tables.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: String,
        column: String,
    },
    Literal(Value),
    Parameter(String),
    Compare {
        op: CompareOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    And(Box<SqlExpr>, Box<SqlExpr>),
    Or(Box<SqlExpr>, Box<SqlExpr>),
    Not(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    /// The discriminator restriction of one query source.
    Discriminator {
        source: QuerySourceId,
        predicate: Box<SqlExpr>,
    },
}

impl SqlExpr {
    pub fn column(table: &str, column: &str) -> Self {
        SqlExpr::Column {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    pub fn compare(op: CompareOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::compare(CompareOp::Eq, left, right)
    }

    pub fn and(self, other: SqlExpr) -> Self {
        SqlExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: SqlExpr) -> Self {
        SqlExpr::Or(Box::new(self), Box::new(other))
    }

    /// Folds `exprs` with `OR`. `None` when empty.
    pub fn any(exprs: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
        exprs.into_iter().reduce(SqlExpr::or)
    }
}

/// One entry of the projection list.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasExpr {
    pub expr: SqlExpr,
    pub alias: Option<String>,
    /// `false` for columns used only by the predicate.
    pub projected: bool,
    pub source: Option<QuerySourceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub table: TableExpr,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderingExpr {
    pub expr: SqlExpr,
    pub direction: Direction,
}

/// A translated query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectExpr {
    pub from: TableExpr,
    pub joins: Vec<JoinExpr>,
    projection: Vec<AliasExpr>,
    pub predicate: Option<SqlExpr>,
    pub order_by: Vec<OrderingExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectExpr {
    pub fn new(from: TableExpr) -> Self {
        SelectExpr {
            from,
            joins: Vec::new(),
            projection: Vec::new(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Tables in `FROM` order.
    pub fn tables(&self) -> impl Iterator<Item = &TableExpr> {
        std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.table))
    }

    pub fn table_for(&self, source: QuerySourceId) -> Option<&TableExpr> {
        self.tables().find(|t| t.source == source)
    }

    // -------------------------------------------------------------------
    // Projection
    // -------------------------------------------------------------------

    /// Projected entries, in result-row order.
    pub fn projection(&self) -> impl Iterator<Item = &AliasExpr> {
        self.projection.iter().filter(|a| a.projected)
    }

    /// Every entry, including filter-only columns.
    pub fn all_columns(&self) -> &[AliasExpr] {
        &self.projection
    }

    pub fn projection_len(&self) -> usize {
        self.projection().count()
    }

    /// Projects `expr` and returns its position in the result row. An
    /// existing projected entry for `expr` is reused; an existing filter-only
    /// entry is promoted and moved to the end.
    pub fn add_to_projection(&mut self, expr: SqlExpr, source: Option<QuerySourceId>) -> usize {
        if let Some(pos) = self.projection.iter().position(|a| a.expr == expr) {
            if self.projection[pos].projected {
                return self.projection[..pos].iter().filter(|a| a.projected).count();
            }
            self.projection.remove(pos);
        }
        let index = self.projection_len();
        self.projection.push(AliasExpr {
            alias: None,
            expr,
            projected: true,
            source,
        });
        index
    }

    /// Makes `expr` available to the predicate without projecting it.
    pub fn add_filter_column(&mut self, expr: SqlExpr, source: Option<QuerySourceId>) -> SqlExpr {
        if !self.projection.iter().any(|a| a.expr == expr) {
            self.projection.push(AliasExpr {
                alias: None,
                expr: expr.clone(),
                projected: false,
                source,
            });
        }
        expr
    }

    /// The single entry of `source` reading `column`, projected or not.
    pub fn find_column(&self, source: QuerySourceId, column: &str) -> Option<&AliasExpr> {
        let mut found = self.projection.iter().filter(|a| {
            a.source == Some(source)
                && matches!(&a.expr, SqlExpr::Column { column: c, .. } if c == column)
        });
        match (found.next(), found.next()) {
            (Some(entry), None) => Some(entry),
            _ => None,
        }
    }

    // -------------------------------------------------------------------
    // Predicates
    // -------------------------------------------------------------------

    /// `AND`s `predicate` onto the existing predicate.
    pub fn add_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
    }

    /// Installs the discriminator predicate of `source`, replacing any
    /// previous one of the same source.
    pub fn set_discriminator_predicate(&mut self, source: QuerySourceId, predicate: SqlExpr) {
        let wrapped = SqlExpr::Discriminator {
            source,
            predicate: Box::new(predicate),
        };
        if let Some(existing) = self.predicate.as_mut() {
            if replace_discriminator(existing, &wrapped) {
                return;
            }
        }
        self.add_predicate(wrapped);
    }

    /// The discriminator predicate currently attached to `source`.
    pub fn discriminator_predicate(&self, source: QuerySourceId) -> Option<&SqlExpr> {
        self.predicate
            .as_ref()
            .and_then(|p| find_discriminator(p, source))
    }
}

/// Replaces the discriminator node of `replacement`'s source inside `expr`.
/// Returns `true` if one was found.
fn replace_discriminator(expr: &mut SqlExpr, replacement: &SqlExpr) -> bool {
    let SqlExpr::Discriminator { source: wanted, .. } = replacement else {
        return false;
    };
    if matches!(expr, SqlExpr::Discriminator { source, .. } if *source == *wanted) {
        *expr = replacement.clone();
        return true;
    }
    match expr {
        SqlExpr::And(l, r) | SqlExpr::Or(l, r) => {
            replace_discriminator(l, replacement) || replace_discriminator(r, replacement)
        }
        SqlExpr::Not(inner) | SqlExpr::IsNull(inner) => replace_discriminator(inner, replacement),
        _ => false,
    }
}

fn find_discriminator(expr: &SqlExpr, wanted: QuerySourceId) -> Option<&SqlExpr> {
    match expr {
        SqlExpr::Discriminator { source, predicate } if *source == wanted => Some(predicate),
        SqlExpr::And(l, r) | SqlExpr::Or(l, r) => {
            find_discriminator(l, wanted).or_else(|| find_discriminator(r, wanted))
        }
        SqlExpr::Not(inner) | SqlExpr::IsNull(inner) => find_discriminator(inner, wanted),
        _ => None,
    }
}
