//! Translation of a [`QueryModel`] into a [`SelectExpr`] plus the
//! [`ResultShaper`] that turns its rows into results.
//!
//! Both backends start here; the relational backend then renders SQL, the
//! in-memory backend evaluates the select expression directly. Each query
//! source gets the table alias `t{id}`.

use std::collections::HashMap;

use quarry_core::{EntityTypeId, Expr, Model, QueryModel, QuerySourceId, Selector};

use crate::context::ResultShaper;
use crate::error::StorageError;
use crate::materializer::MaterializerFactory;
use crate::select::{JoinExpr, OrderingExpr, SelectExpr, SqlExpr, TableExpr};

/// A translated query.
#[derive(Debug, Clone)]
pub struct QueryTranslation {
    pub select: SelectExpr,
    pub shaper: ResultShaper,
}

pub fn table_alias(source: QuerySourceId) -> String {
    format!("t{}", source.0)
}

/// Translates `query` against `model`.
pub fn translate(
    model: &Model,
    factory: &MaterializerFactory,
    query: &QueryModel,
) -> Result<QueryTranslation, StorageError> {
    let translator = Translator::new(model, query)?;

    let mut select = SelectExpr::new(translator.table(query.from.id)?);
    for join in &query.joins {
        let inner_type = translator.entity_type(join.source.id)?;
        let inner_column = model.property(inner_type, &join.inner_key)?.column_name();
        select.joins.push(JoinExpr {
            table: translator.table(join.source.id)?,
            on: SqlExpr::equals(
                translator.expr(&join.outer_key)?,
                SqlExpr::column(&table_alias(join.source.id), inner_column),
            ),
        });
    }

    if let Some(filter) = &query.filter {
        select.add_predicate(translator.expr(filter)?);
    }

    for ordering in &query.order_by {
        select.order_by.push(OrderingExpr {
            expr: translator.expr(&ordering.expr)?,
            direction: ordering.direction,
        });
    }
    select.limit = query.take;
    select.offset = query.skip;

    let materialized_sources: Vec<QuerySourceId> = match &query.selector {
        Selector::Entity(source) => vec![*source],
        Selector::Entities(sources) => sources.clone(),
        Selector::Properties(_) => Vec::new(),
    };

    let mut materializers = Vec::with_capacity(materialized_sources.len());
    for source in &materialized_sources {
        let alias = table_alias(*source);
        let materializer = factory.create_materializer(
            model,
            translator.entity_type(*source)?,
            &mut select,
            |s, p| s.add_to_projection(SqlExpr::column(&alias, p.column_name()), Some(*source)),
            *source,
        )?;
        materializers.push(materializer);
    }

    let shaper = match &query.selector {
        Selector::Entity(_) => match materializers.pop() {
            Some(materializer) => ResultShaper::Entity(materializer),
            None => return Err(StorageError::translation("entity selector without a source")),
        },
        Selector::Entities(_) => ResultShaper::Entities(materializers),
        Selector::Properties(exprs) => {
            let mut columns = Vec::with_capacity(exprs.len());
            for expr in exprs {
                let Expr::Property { source, property } = expr else {
                    return Err(StorageError::translation(
                        "only property references can be selected as values",
                    ));
                };
                let prop = model.property(translator.entity_type(*source)?, property)?;
                let index = select.add_to_projection(
                    SqlExpr::column(&table_alias(*source), prop.column_name()),
                    Some(*source),
                );
                columns.push((index, prop.value_type));
            }
            ResultShaper::Values(columns)
        }
    };

    // Sources that are only joined or read through scalars still see only
    // rows of their own entity type.
    for source in query.sources() {
        if materialized_sources.contains(&source.id) {
            continue;
        }
        let alias = table_alias(source.id);
        factory.apply_discriminator_filter(
            model,
            source.entity_type,
            &mut select,
            |p| SqlExpr::column(&alias, p.column_name()),
            source.id,
        )?;
    }

    Ok(QueryTranslation { select, shaper })
}

struct Translator<'a> {
    model: &'a Model,
    source_types: HashMap<QuerySourceId, EntityTypeId>,
}

impl<'a> Translator<'a> {
    fn new(model: &'a Model, query: &QueryModel) -> Result<Self, StorageError> {
        let mut source_types = HashMap::new();
        for source in query.sources() {
            model.entity_type(source.entity_type)?;
            if source_types.insert(source.id, source.entity_type).is_some() {
                return Err(StorageError::translation(format!(
                    "query source {} is declared twice",
                    source.id
                )));
            }
        }
        Ok(Translator {
            model,
            source_types,
        })
    }

    fn entity_type(&self, source: QuerySourceId) -> Result<EntityTypeId, StorageError> {
        self.source_types
            .get(&source)
            .copied()
            .ok_or(StorageError::Core(quarry_core::CoreError::QuerySourceNotFound { id: source }))
    }

    fn table(&self, source: QuerySourceId) -> Result<TableExpr, StorageError> {
        Ok(TableExpr {
            table: self.model.table_name(self.entity_type(source)?)?.to_string(),
            alias: table_alias(source),
            source,
        })
    }

    fn expr(&self, expr: &Expr) -> Result<SqlExpr, StorageError> {
        let translated = match expr {
            Expr::Property { source, property } => {
                let prop = self.model.property(self.entity_type(*source)?, property)?;
                SqlExpr::column(&table_alias(*source), prop.column_name())
            }
            Expr::Constant(value) => SqlExpr::Literal(value.clone()),
            Expr::Parameter(name) => SqlExpr::Parameter(name.clone()),
            Expr::Compare { op, left, right } => SqlExpr::compare(*op, self.expr(left)?, self.expr(right)?),
            Expr::And(left, right) => self.expr(left)?.and(self.expr(right)?),
            Expr::Or(left, right) => self.expr(left)?.or(self.expr(right)?),
            Expr::Not(inner) => SqlExpr::Not(Box::new(self.expr(inner)?)),
            Expr::IsNull(inner) => SqlExpr::IsNull(Box::new(self.expr(inner)?)),
        };
        Ok(translated)
    }
}
