//! Batch delete and update executed against SQLite.

mod common;

use std::sync::Arc;

use common::{items, model, sqlite, stored, Item};
use rust_decimal::Decimal;
use sql_bulk_ops::{BulkConfig, BulkExecutor, Expr, RenderedQuery, SqlValue};

fn executor() -> BulkExecutor {
    BulkExecutor::new(Arc::new(model())).with_config(BulkConfig::default())
}

/// Items with a quantity above `min`, as a query engine would render it.
fn quantity_above(min: i32) -> RenderedQuery {
    RenderedQuery::new(
        "SELECT \"i\".\"ItemId\", \"i\".\"Name\", \"i\".\"Quantity\", \"i\".\"Price\"\n\
         FROM \"Item\" AS \"i\"\n\
         WHERE \"i\".\"Quantity\" > @__min_0",
    )
    .with_parameter("__min_0", min)
}

#[tokio::test]
async fn test_batch_delete_removes_selected_rows() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(10))
        .await
        .unwrap();

    let deleted = executor
        .batch_delete(&mut conn, &quantity_above(6))
        .await
        .unwrap();

    assert_eq!(deleted, 4);
    let keys: Vec<i32> = stored(&mut conn).await.iter().map(|r| r.item_id).collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_batch_delete_with_leading_comment() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(3))
        .await
        .unwrap();

    let mut query = quantity_above(0);
    query.sql = format!("-- nightly cleanup\n{}", query.sql);
    let deleted = executor.batch_delete(&mut conn, &query).await.unwrap();

    assert_eq!(deleted, 3);
}

#[tokio::test]
async fn test_batch_update_sets_non_default_values() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(5))
        .await
        .unwrap();

    let values = Item {
        item_id: 0,
        name: Some("clearance".into()),
        quantity: 0,
        price: Decimal::ZERO,
    };
    let updated = executor
        .batch_update(&mut conn, &quantity_above(3), &values, &[])
        .await
        .unwrap();

    assert_eq!(updated, 2);
    let stored = stored(&mut conn).await;
    assert_eq!(stored[3].name.as_deref(), Some("clearance"));
    assert_eq!(stored[3].quantity, 4);
    assert_eq!(stored[2].name.as_deref(), Some("item 3"));
}

#[tokio::test]
async fn test_batch_update_forces_listed_default_values() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(5))
        .await
        .unwrap();

    let values = Item {
        item_id: 0,
        name: Some("sold out".into()),
        quantity: 0,
        price: Decimal::ZERO,
    };
    executor
        .batch_update(&mut conn, &quantity_above(2), &values, &["Quantity".to_string()])
        .await
        .unwrap();

    let stored = stored(&mut conn).await;
    assert!(stored[2..].iter().all(|r| r.quantity == 0));
    assert_eq!(stored[1].quantity, 2);
}

#[tokio::test]
async fn test_batch_update_with_expression() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(4))
        .await
        .unwrap();

    let expression = Expr::member_init([
        ("Quantity", Expr::add(Expr::member("Quantity"), Expr::constant(100i32))),
        ("Name", Expr::concat(Expr::member("Name"), Expr::constant(" (restocked)"))),
    ]);
    let updated = executor
        .batch_update_with(&mut conn, &quantity_above(2), "Item", &expression)
        .await
        .unwrap();

    assert_eq!(updated, 2);
    let stored = stored(&mut conn).await;
    assert_eq!(stored[3].quantity, 104);
    assert_eq!(stored[3].name.as_deref(), Some("item 4 (restocked)"));
    assert_eq!(stored[0].quantity, 1);
}

#[tokio::test]
async fn test_batch_update_with_nested_arithmetic_keeps_grouping() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(3))
        .await
        .unwrap();

    let expression = Expr::member_init([(
        "Quantity",
        Expr::multiply(
            Expr::add(Expr::member("Quantity"), Expr::constant(1i32)),
            Expr::constant(10i32),
        ),
    )]);
    executor
        .batch_update_with(&mut conn, &quantity_above(0), "Item", &expression)
        .await
        .unwrap();

    let quantities: Vec<i32> = stored(&mut conn).await.iter().map(|r| r.quantity).collect();
    assert_eq!(quantities, vec![20, 30, 40]);
}

#[tokio::test]
async fn test_batch_update_with_nothing_to_set_fails_before_io() {
    let mut conn = sqlite();
    let values = Item::key(0);

    let err = executor()
        .batch_update(&mut conn, &quantity_above(0), &values, &[])
        .await
        .unwrap_err();

    assert!(err.is_synthesis());
}

#[tokio::test]
async fn test_batch_statement_parameters_bind_by_name() {
    let mut conn = sqlite();
    let executor = executor();
    executor
        .insert(&mut conn, "Item", &mut items(6))
        .await
        .unwrap();

    let query = RenderedQuery::new(
        "SELECT \"i\".\"ItemId\"\nFROM \"Item\" AS \"i\"\nWHERE \"i\".\"Quantity\" BETWEEN @__lo_0 AND @__hi_1",
    )
    .with_parameter("__lo_0", 2i32)
    .with_parameter("__hi_1", SqlValue::I64(4));

    assert_eq!(executor.batch_delete(&mut conn, &query).await.unwrap(), 3);
}
