//! Structural fingerprints of query models using blake3.
//!
//! Two queries with the same shape but different parameter values get the
//! same [`QueryFingerprint`]; any change to sources, joins, filter
//! structure, constants, ordering, paging, or selector changes it.
//!
//! # Determinism
//!
//! The shape is serialized with `serde_json::to_vec`. The query model holds
//! no `HashMap` (parameters are an `IndexMap` and are excluded anyway), so
//! the same shape always produces the same bytes.

use std::fmt;

use quarry_core::query::{JoinClause, Ordering};
use quarry_core::{Expr, QueryModel, QuerySource, Selector};
use serde::Serialize;

use crate::error::StorageError;

/// A structural hash of a [`QueryModel`], used as the compiled query cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint(blake3::Hash);

impl QueryFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryFingerprint({})", &self.0.to_hex().as_str()[..16])
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// Everything in a query model except its parameter values.
#[derive(Serialize)]
struct QueryShape<'a> {
    from: &'a QuerySource,
    joins: &'a [JoinClause],
    filter: &'a Option<Expr>,
    order_by: &'a [Ordering],
    skip: Option<u64>,
    take: Option<u64>,
    selector: &'a Selector,
}

/// Computes the fingerprint of `query`'s shape.
pub fn fingerprint(query: &QueryModel) -> Result<QueryFingerprint, StorageError> {
    let shape = QueryShape {
        from: &query.from,
        joins: &query.joins,
        filter: &query.filter,
        order_by: &query.order_by,
        skip: query.skip,
        take: query.take,
        selector: &query.selector,
    };
    let bytes = serde_json::to_vec(&shape)?;
    Ok(QueryFingerprint(blake3::hash(&bytes)))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use quarry_core::{EntityTypeId, QuerySourceId, Value};

    use super::*;

    fn by_name(name: Value) -> QueryModel {
        QueryModel::entities(EntityTypeId(1))
            .filter(Expr::equals(
                Expr::property(QuerySourceId(0), "Name"),
                Expr::parameter("name"),
            ))
            .with_parameter("name", name)
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint(&by_name(Value::from("Kiwi"))).unwrap();
        let b = fingerprint(&by_name(Value::from("Kiwi"))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn constants_are_part_of_the_shape() {
        let with_constant = |c: &str| {
            QueryModel::entities(EntityTypeId(1)).filter(Expr::equals(
                Expr::property(QuerySourceId(0), "Name"),
                Expr::constant(c),
            ))
        };
        assert_ne!(
            fingerprint(&with_constant("a")).unwrap(),
            fingerprint(&with_constant("b")).unwrap()
        );
    }

    #[test]
    fn paging_and_type_change_the_shape() {
        let base = QueryModel::entities(EntityTypeId(1));
        let fp = fingerprint(&base).unwrap();
        assert_ne!(fp, fingerprint(&base.clone().take(3)).unwrap());
        assert_ne!(fp, fingerprint(&QueryModel::entities(EntityTypeId(2))).unwrap());
    }

    fn any_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            "[a-zA-Z ]{0,16}".prop_map(Value::Text),
        ]
    }

    proptest! {
        #[test]
        fn parameter_values_never_change_the_fingerprint(a in any_value(), b in any_value()) {
            prop_assert_eq!(
                fingerprint(&by_name(a)).unwrap(),
                fingerprint(&by_name(b)).unwrap()
            );
        }
    }
}
