pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Table names the engine reads and writes. These, together with the
/// serialized enum strings, are the engine's versioned storage contract:
/// adding a table or column is additive, renaming one is a migration.
pub mod tables {
    pub const CONSENT_RECORDS: &str = "consent_records";
    pub const CONSENT_HISTORY: &str = "consent_history";
    pub const COOKIE_CONSENTS: &str = "cookie_consents";
    pub const COOKIE_CONSENT_LOG: &str = "cookie_consent_log";
    pub const DSAR_REQUESTS: &str = "dsar_requests";
    pub const RETENTION_RULES: &str = "retention_rules";
    pub const LEGAL_HOLDS: &str = "legal_holds";
    pub const RETENTION_ACTIONS: &str = "retention_actions";
    pub const PROCESSING_RESTRICTIONS: &str = "processing_restrictions";
    pub const DATA_EXPORTS: &str = "data_exports";

    // Subject-data tables the engine sweeps and erases but does not own.
    pub const USERS: &str = "users";
    pub const DEVICES: &str = "devices";
    pub const SESSIONS: &str = "sessions";
    pub const USER_FILES: &str = "user_files";
    pub const ACTIVITY_LOG: &str = "activity_log";
    pub const MESSAGES: &str = "messages";
    pub const TRANSACTIONS: &str = "transactions";
    pub const ANALYTICS_EVENTS: &str = "analytics_events";
    pub const SYSTEM_LOGS: &str = "system_logs";
    pub const BACKUPS: &str = "backups";
    pub const CONSENTS_ARCHIVE: &str = "consents_archive";
}

/// One stored record, column name to JSON value. Typed records convert
/// through serde (`DateTime<Utc>` lands as an RFC 3339 string, `Uuid` as its
/// hyphenated form).
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("malformed row in {table}: {reason}")]
    MalformedRow { table: String, reason: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One condition inside a [`Filter`]. Comparisons on timestamp columns use
/// the serialized RFC 3339 form; adapters must compare them as instants.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    IsNull(String),
    IsNotNull(String),
    In(String, Vec<Value>),
}

/// Conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn ne(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ne(column.to_string(), value.into()));
        self
    }

    pub fn lt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lt(column.to_string(), value.into()));
        self
    }

    pub fn le(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Le(column.to_string(), value.into()));
        self
    }

    pub fn gt(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gt(column.to_string(), value.into()));
        self
    }

    pub fn ge(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Ge(column.to_string(), value.into()));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn is_not_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNotNull(column.to_string()));
        self
    }

    pub fn is_in(mut self, column: &str, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In(column.to_string(), values));
        self
    }

    pub fn eq_uuid(self, column: &str, id: Uuid) -> Self {
        self.eq(column, id.to_string())
    }

    pub fn before(self, column: &str, cutoff: DateTime<Utc>) -> Self {
        self.lt(column, datetime_value(cutoff))
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
}

/// Serialize a timestamp the same way serde does for record fields, so
/// filters and stored rows agree.
pub fn datetime_value(ts: DateTime<Utc>) -> Value {
    serde_json::to_value(ts).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Mutating operation. `execute` returns the affected-row count, which makes
/// cutoff-keyed deletes naturally idempotent and re-entrant.
#[derive(Debug, Clone)]
pub enum Statement {
    Insert {
        table: String,
        row: Row,
    },
    Update {
        table: String,
        filter: Filter,
        changes: Row,
    },
    Delete {
        table: String,
        filter: Filter,
    },
}

impl Statement {
    pub fn insert(table: &str, row: Row) -> Self {
        Self::Insert {
            table: table.to_string(),
            row,
        }
    }

    pub fn update(table: &str, filter: Filter, changes: Row) -> Self {
        Self::Update {
            table: table.to_string(),
            filter,
            changes,
        }
    }

    pub fn delete(table: &str, filter: Filter) -> Self {
        Self::Delete {
            table: table.to_string(),
            filter,
        }
    }
}

/// Read operation.
#[derive(Debug, Clone)]
pub struct Query {
    pub table: String,
    pub filter: Filter,
    pub order_by: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: &str, filter: Filter) -> Self {
        Self {
            table: table.to_string(),
            filter,
            order_by: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Narrow storage adapter the whole engine runs against. Relational and
/// document backends implement this outside the crate; [`MemoryStore`] is the
/// in-tree implementation used by tests and embedders.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a mutating statement; returns the number of affected rows.
    async fn execute(&self, stmt: Statement) -> Result<u64, StoreError>;

    /// Fetch at most one row.
    async fn fetch_one(&self, query: Query) -> Result<Option<Row>, StoreError>;

    /// Fetch all matching rows.
    async fn fetch_all(&self, query: Query) -> Result<Vec<Row>, StoreError>;

    /// Count matching rows without materializing them. Default falls back to
    /// `fetch_all`.
    async fn count(&self, query: Query) -> Result<u64, StoreError> {
        Ok(self.fetch_all(query).await?.len() as u64)
    }
}

/// Convert a typed record into a stored row.
pub fn to_row<T: serde::Serialize>(record: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::MalformedRow {
            table: String::new(),
            reason: format!("record serialized to non-object: {other}"),
        }),
        Err(e) => Err(StoreError::MalformedRow {
            table: String::new(),
            reason: e.to_string(),
        }),
    }
}

/// Convert a stored row back into a typed record.
pub fn from_row<T: serde::de::DeserializeOwned>(table: &str, row: Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::MalformedRow {
        table: table.to_string(),
        reason: e.to_string(),
    })
}
