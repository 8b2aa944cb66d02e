//! Record-oriented persistence facade.
//!
//! Both backends (document and relational) implement [`Store`] so the auth
//! layer never depends on a concrete database. Records are key-ordered maps of
//! [`Value`]s; the reserved key [`ID_FIELD`] always carries the backend's
//! native key rendered as an opaque string.

use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

pub mod memory;
pub mod mongo;
pub mod postgres;
mod sql;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use postgres::PgStore;

/// Field name under which every backend exposes the record identifier.
pub const ID_FIELD: &str = "id";

/// Deadline for a single CRUD call.
pub const OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for connecting to or disconnecting from a backend.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record not found")]
    NotFound,

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unique constraint violated")]
    Conflict,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(OffsetDateTime),
    /// Nested, schema-free data (objects, arrays and scalars inside them).
    Json(serde_json::Value),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as JSON; used for nested comparisons and by
    /// backends that only understand JSON documents.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            Value::Text(s) => J::String(s.clone()),
            Value::Timestamp(t) => t
                .format(&time::format_description::well_known::Rfc3339)
                .map(J::String)
                .unwrap_or(J::Null),
            Value::Json(j) => j.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(t: OffsetDateTime) -> Self {
        Value::Timestamp(t)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

/// Conjunction of field conditions. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(ID_FIELD, Value::Text(id.into()))
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Op::Eq, value)
    }

    pub fn with(mut self, field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set(String, Value),
    Unset(String),
}

/// Partial update applied field by field, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub changes: Vec<Change>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.push(Change::Set(field.into(), value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.changes.push(Change::Unset(field.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts `record` and returns the identifier assigned by the backend.
    /// Any caller-supplied `id` is ignored.
    async fn create_one(&self, name: &str, record: Record) -> Result<String, StoreError>;

    async fn find_one(&self, name: &str, filter: &Filter) -> Result<Record, StoreError>;

    async fn find_many(&self, name: &str, filter: &Filter) -> Result<Vec<Record>, StoreError>;

    async fn update_one(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<(), StoreError>;

    async fn update_many(&self, name: &str, filter: &Filter, patch: &Patch) -> Result<u64, StoreError>;

    async fn delete_one(&self, name: &str, filter: &Filter) -> Result<(), StoreError>;

    async fn delete_many(&self, name: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Installs a storage-level uniqueness constraint on `field`.
    async fn ensure_unique(&self, name: &str, field: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Runs `fut` under `limit`, surfacing an elapsed deadline as
/// [`StoreError::Timeout`].
pub(crate) async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(timeout_ms = limit.as_millis() as u64, "store call timed out");
            Err(StoreError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_builder_collects_conditions_in_order() {
        let f = Filter::by_id("abc").with("age", Op::Gte, 18i64);
        assert_eq!(f.conditions.len(), 2);
        assert_eq!(f.conditions[0].field, ID_FIELD);
        assert_eq!(f.conditions[1].op, Op::Gte);
        assert_eq!(f.conditions[1].value, Value::Int(18));
    }

    #[test]
    fn value_to_json_renders_timestamps_as_rfc3339() {
        let ts = time::macros::datetime!(2024-03-01 12:00:00 UTC);
        assert_eq!(
            Value::Timestamp(ts).to_json(),
            serde_json::json!("2024-03-01T12:00:00Z")
        );
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn with_deadline_reports_timeout() {
        let res: Result<(), StoreError> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(StoreError::Timeout)));
    }
}
