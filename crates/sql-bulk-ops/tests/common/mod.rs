//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rust_decimal::Decimal;
use sql_bulk_ops::{
    BulkError, EntityType, Model, PropertyMeta, Record, Result, SqlValue, SqliteConnection,
    ValueKind,
};

pub const CREATE_ITEM: &str = "CREATE TABLE \"Item\" (\
    \"ItemId\" INTEGER PRIMARY KEY AUTOINCREMENT, \
    \"Name\" TEXT, \
    \"Quantity\" INTEGER NOT NULL, \
    \"Price\" TEXT NOT NULL)";

/// Record type used throughout the tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub item_id: i32,
    pub name: Option<String>,
    pub quantity: i32,
    pub price: Decimal,
}

impl Item {
    pub fn new(item_id: i32, name: &str, quantity: i32) -> Self {
        Self {
            item_id,
            name: Some(name.to_string()),
            quantity,
            price: Decimal::new(i64::from(quantity) * 100 + 99, 2),
        }
    }

    /// A record carrying only its key, as passed to bulk read.
    pub fn key(item_id: i32) -> Self {
        Self {
            item_id,
            name: None,
            quantity: 0,
            price: Decimal::ZERO,
        }
    }
}

impl Record for Item {
    fn entity_name(&self) -> &str {
        "Item"
    }

    fn get(&self, property: &str) -> Option<SqlValue<'static>> {
        match property {
            "ItemId" => Some(SqlValue::I32(self.item_id)),
            "Name" => Some(match &self.name {
                Some(name) => SqlValue::text_owned(name.clone()),
                None => SqlValue::Null(ValueKind::String),
            }),
            "Quantity" => Some(SqlValue::I32(self.quantity)),
            "Price" => Some(SqlValue::Decimal(self.price)),
            _ => None,
        }
    }

    fn set(&mut self, property: &str, value: SqlValue<'static>) -> Result<()> {
        match (property, value) {
            ("ItemId", SqlValue::I32(v)) => self.item_id = v,
            ("Name", SqlValue::Null(_)) => self.name = None,
            ("Name", SqlValue::Text(v)) => self.name = Some(v.into_owned()),
            ("Quantity", SqlValue::I32(v)) => self.quantity = v,
            ("Price", SqlValue::Decimal(v)) => self.price = v,
            (property, value) => {
                return Err(BulkError::Metadata(format!(
                    "cannot assign {:?} to Item.{}",
                    value, property
                )))
            }
        }
        Ok(())
    }
}

pub fn model() -> Model {
    Model::new().with_entity(
        EntityType::new("Item", "Item")
            .property(PropertyMeta::new("ItemId", ValueKind::I32).identity())
            .property(PropertyMeta::new("Name", ValueKind::String).nullable())
            .property(PropertyMeta::new("Quantity", ValueKind::I32))
            .property(PropertyMeta::new("Price", ValueKind::Decimal)),
    )
}

pub fn items(n: usize) -> Vec<Item> {
    (1..=n)
        .map(|i| Item::new(i as i32, &format!("item {}", i), (i % 50) as i32))
        .collect()
}

/// An in-memory database with the `Item` table created.
pub fn sqlite() -> SqliteConnection {
    let conn = rusqlite::Connection::open_in_memory().expect("open in-memory database");
    conn.execute_batch(CREATE_ITEM).expect("create Item table");
    SqliteConnection::from_connection(conn)
}

/// Every stored item, ordered by key.
pub async fn stored(conn: &mut SqliteConnection) -> Vec<Item> {
    use sql_bulk_ops::BulkConnection;

    let rows = conn
        .query(
            "SELECT \"ItemId\", \"Name\", \"Quantity\", \"Price\" FROM \"Item\" ORDER BY \"ItemId\"",
            &[],
        )
        .await
        .expect("select items");
    rows.into_iter()
        .map(|row| Item {
            item_id: row[0].as_i64().expect("integer key") as i32,
            name: row[1].as_str().map(str::to_string),
            quantity: row[2].as_i64().expect("integer quantity") as i32,
            price: row[3].as_str().and_then(|s| s.parse().ok()).expect("decimal price"),
        })
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sql_bulk_ops=debug")
        .with_test_writer()
        .try_init();
}
