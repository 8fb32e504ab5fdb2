use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Condition, Filter, Order, Query, Row, Statement, Store, StoreError};

/// In-memory [`Store`] backed by a table-name → rows map. Used by the test
/// suite and by embedders that do not need persistence. Unknown tables
/// spring into existence on insert and read as empty, which matches how the
/// engine treats foreign subject-data tables it does not own.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with rows, for tests and fixtures.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub async fn table_len(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, stmt: Statement) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        match stmt {
            Statement::Insert { table, row } => {
                tables.entry(table).or_default().push(row);
                Ok(1)
            }
            Statement::Update {
                table,
                filter,
                changes,
            } => {
                let rows = tables.entry(table).or_default();
                let mut affected = 0;
                for row in rows.iter_mut() {
                    if matches(row, &filter) {
                        for (column, value) in &changes {
                            row.insert(column.clone(), value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(affected)
            }
            Statement::Delete { table, filter } => {
                let rows = tables.entry(table).or_default();
                let before = rows.len();
                rows.retain(|row| !matches(row, &filter));
                Ok((before - rows.len()) as u64)
            }
        }
    }

    async fn fetch_one(&self, query: Query) -> Result<Option<Row>, StoreError> {
        Ok(self.fetch_all(query).await?.into_iter().next())
    }

    async fn fetch_all(&self, query: Query) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches(row, &query.filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, order)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = compare(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows)
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    filter.conditions().iter().all(|cond| match cond {
        Condition::Eq(col, value) => field(row, col) == *value,
        Condition::Ne(col, value) => field(row, col) != *value,
        Condition::Lt(col, value) => cmp_is(row, col, value, Ordering::Less),
        Condition::Gt(col, value) => cmp_is(row, col, value, Ordering::Greater),
        Condition::Le(col, value) => !cmp_is(row, col, value, Ordering::Greater) && has_cmp(row, col, value),
        Condition::Ge(col, value) => !cmp_is(row, col, value, Ordering::Less) && has_cmp(row, col, value),
        Condition::IsNull(col) => field(row, col).is_null(),
        Condition::IsNotNull(col) => !field(row, col).is_null(),
        Condition::In(col, values) => values.contains(&field(row, col)),
    })
}

fn field(row: &Row, column: &str) -> Value {
    row.get(column).cloned().unwrap_or(Value::Null)
}

fn cmp_is(row: &Row, column: &str, value: &Value, want: Ordering) -> bool {
    compare(&field(row, column), value) == Some(want)
}

fn has_cmp(row: &Row, column: &str, value: &Value) -> bool {
    compare(&field(row, column), value).is_some()
}

/// Value comparison aware of serialized timestamps: two strings that both
/// parse as RFC 3339 are compared as instants, since fractional-second
/// formatting breaks lexicographic order.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let store = MemoryStore::new();
        store
            .execute(Statement::insert("things", row(&[("id", json!("a"))])))
            .await
            .unwrap();

        let found = store
            .fetch_one(Query::new("things", Filter::new().eq("id", "a")))
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .fetch_one(Query::new("things", Filter::new().eq("id", "b")))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_returns_affected_count() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .execute(Statement::insert(
                    "things",
                    row(&[("id", json!(i)), ("status", json!("old"))]),
                ))
                .await
                .unwrap();
        }

        let affected = store
            .execute(Statement::update(
                "things",
                Filter::new().eq("status", "old"),
                row(&[("status", json!("new"))]),
            ))
            .await
            .unwrap();
        assert_eq!(affected, 3);

        // Second pass matches nothing: conditional updates are idempotent.
        let affected = store
            .execute(Statement::update(
                "things",
                Filter::new().eq("status", "old"),
                row(&[("status", json!("new"))]),
            ))
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn timestamp_cutoff_compares_as_instants() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = now - Duration::days(40);
        let fresh = now - Duration::days(10);

        store
            .seed(
                "sessions",
                vec![
                    row(&[("id", json!("old")), ("created_at", serde_json::to_value(old).unwrap())]),
                    row(&[("id", json!("fresh")), ("created_at", serde_json::to_value(fresh).unwrap())]),
                ],
            )
            .await;

        let cutoff = now - Duration::days(30);
        let deleted = store
            .execute(Statement::delete(
                "sessions",
                Filter::new().before("created_at", cutoff),
            ))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.table_len("sessions").await, 1);
    }

    #[tokio::test]
    async fn null_checks_cover_missing_columns() {
        let store = MemoryStore::new();
        store
            .seed(
                "consents",
                vec![
                    row(&[("id", json!("anon"))]),
                    row(&[("id", json!("bound")), ("subject_id", json!("u1"))]),
                    row(&[("id", json!("explicit")), ("subject_id", Value::Null)]),
                ],
            )
            .await;

        let anonymous = store
            .fetch_all(Query::new("consents", Filter::new().is_null("subject_id")))
            .await
            .unwrap();
        assert_eq!(anonymous.len(), 2);
    }

    #[tokio::test]
    async fn order_and_limit() {
        let store = MemoryStore::new();
        for i in [3, 1, 2] {
            store
                .execute(Statement::insert("n", row(&[("v", json!(i))])))
                .await
                .unwrap();
        }

        let rows = store
            .fetch_all(Query::new("n", Filter::all()).order_by("v", Order::Desc).limit(2))
            .await
            .unwrap();
        let values: Vec<i64> = rows.iter().map(|r| r["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![3, 2]);
    }
}
