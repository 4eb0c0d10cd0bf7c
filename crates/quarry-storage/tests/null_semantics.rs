//! Three-valued logic: both backends must filter the same rows when a
//! predicate involves `NULL`.

use std::sync::Arc;

use quarry_core::entity::values;
use quarry_core::{
    CompareOp, Direction, Entity, EntityTypeDef, EntityTypeId, Expr, Model, PendingEntry, Property, QueryModel,
    QuerySourceId, Value, ValueType,
};
use quarry_storage::{DataStore, InMemoryStore, SqliteStore, StoreOptions};

const BLOG: EntityTypeId = EntityTypeId(0);

fn model() -> Arc<Model> {
    let mut model = Model::new();
    model
        .add_entity_type(
            EntityTypeDef::new("Blog")
                .property(Property::new("Id", ValueType::Integer))
                .property(Property::new("Rating", ValueType::Integer).nullable())
                .property(Property::new("Title", ValueType::Text).nullable())
                .key(&["Id"]),
        )
        .unwrap();
    Arc::new(model)
}

fn rows() -> Vec<PendingEntry> {
    let row = |id: i64, rating: Option<i64>, title: Option<&str>| {
        PendingEntry::added(
            BLOG,
            values([
                ("Id", Value::Integer(id)),
                ("Rating", rating.map_or(Value::Null, Value::Integer)),
                ("Title", title.map_or(Value::Null, Value::from)),
            ]),
        )
    };
    vec![
        row(1, Some(5), Some("first")),
        row(2, None, Some("second")),
        row(3, Some(1), None),
        row(4, None, None),
    ]
}

fn ids<S: DataStore>(store: &S, filter: Expr, parameter: Option<Value>) -> Vec<i64> {
    let mut query = QueryModel::entities(BLOG)
        .filter(filter)
        .order_by(Expr::property(QuerySourceId(0), "Id"), Direction::Ascending);
    if let Some(value) = parameter {
        query = query.with_parameter("p", value);
    }
    store
        .query::<Entity>(&query)
        .unwrap()
        .map(|e| match e.unwrap().get("Id") {
            Some(Value::Integer(id)) => *id,
            other => panic!("unexpected id {other:?}"),
        })
        .collect()
}

fn rating() -> Expr {
    Expr::property(QuerySourceId(0), "Rating")
}

fn title() -> Expr {
    Expr::property(QuerySourceId(0), "Title")
}

/// (filter, parameter, expected ids)
fn cases() -> Vec<(Expr, Option<Value>, Vec<i64>)> {
    vec![
        (Expr::compare(CompareOp::Ne, rating(), Expr::constant(5i64)), None, vec![3]),
        (Expr::equals(rating(), Expr::parameter("p")), Some(Value::Null), vec![]),
        (rating().is_null(), None, vec![2, 4]),
        (rating().is_null().negate(), None, vec![1, 3]),
        (
            Expr::compare(CompareOp::Lt, rating(), Expr::constant(3i64)).negate(),
            None,
            vec![1],
        ),
        (
            Expr::compare(CompareOp::Gt, rating(), Expr::constant(4i64)).or(title().is_null()),
            None,
            vec![1, 3, 4],
        ),
        (
            Expr::compare(CompareOp::Ge, rating(), Expr::constant(0i64))
                .and(Expr::equals(title(), Expr::constant("first"))),
            None,
            vec![1],
        ),
    ]
}

#[test]
fn memory_backend_uses_three_valued_logic() {
    let store = InMemoryStore::new("nulls", model(), StoreOptions::default());
    store.save_changes(&rows()).unwrap();
    for (filter, parameter, expected) in cases() {
        assert_eq!(ids(&store, filter.clone(), parameter), expected, "{filter:?}");
    }
}

#[test]
fn sqlite_backend_uses_three_valued_logic() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("nulls.db"), model(), StoreOptions::default());
    store.ensure_created().unwrap();
    store.save_changes(&rows()).unwrap();
    for (filter, parameter, expected) in cases() {
        assert_eq!(ids(&store, filter.clone(), parameter), expected, "{filter:?}");
    }
}
