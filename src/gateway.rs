use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const READINGS_TABLE: &str = "mmwave_sensor_data";
pub const DEVICES_TABLE: &str = "moveometers";
pub const ANNOTATIONS_TABLE: &str = "timeline_annotations";
pub const AUDIT_TABLE: &str = "audit_log";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection lock poisoned")]
    Poisoned,

    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Row predicate on a single column
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    NotNull(String),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Filter::Gt(column.to_string(), value.into())
    }

    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(column.to_string(), value.into())
    }

    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(column.to_string(), value.into())
    }

    pub fn not_null(column: &str) -> Self {
        Filter::NotNull(column.to_string())
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _)
            | Filter::Gt(c, _)
            | Filter::Gte(c, _)
            | Filter::Lte(c, _)
            | Filter::NotNull(c) => c,
        }
    }

    /// Evaluate the predicate against a row held in memory
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Filter::Eq(_, v) => compare(field, v) == Some(Ordering::Equal),
            Filter::Gt(_, v) => compare(field, v) == Some(Ordering::Greater),
            Filter::Gte(_, v) => matches!(compare(field, v), Some(Ordering::Greater | Ordering::Equal)),
            Filter::Lte(_, v) => matches!(compare(field, v), Some(Ordering::Less | Ordering::Equal)),
            Filter::NotNull(_) => !field.is_null(),
        }
    }
}

pub fn matches_all(filters: &[Filter], row: &Value) -> bool {
    filters.iter().all(|f| f.matches(row))
}

/// Compare two JSON scalars. Strings that both parse as RFC 3339 timestamps are
/// compared as instants so differing fractional precision does not matter.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Number(y)) | (Value::Number(y), Value::Bool(x)) => {
            let x = if *x { 1.0 } else { 0.0 };
            let ord = x.partial_cmp(&y.as_f64()?)?;
            Some(if matches!(a, Value::Bool(_)) { ord } else { ord.reverse() })
        }
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self { column: column.to_string(), ascending: true }
    }

    pub fn desc(column: &str) -> Self {
        Self { column: column.to_string(), ascending: false }
    }
}

/// Primary key of a hosted row: serial integers locally, text ids elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    pub fn to_value(&self) -> Value {
        match self {
            RowId::Int(i) => Value::from(*i),
            RowId::Text(s) => Value::from(s.as_str()),
        }
    }

    pub fn filter(&self) -> Filter {
        Filter::eq("id", self.to_value())
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(i) => write!(f, "{}", i),
            RowId::Text(s) => f.write_str(s),
        }
    }
}

impl FromStr for RowId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<i64>().map(RowId::Int).unwrap_or_else(|_| RowId::Text(s.to_string())))
    }
}

/// Canonical wire form for timestamps in filters and written rows
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Live feed of rows inserted into one table. Dropping it stops delivery.
pub struct Subscription {
    rows: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(rows: mpsc::UnboundedReceiver<Value>, task: JoinHandle<()>) -> Self {
        Self { rows, task }
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rows.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Operations the dashboard consumes from the hosted backend
pub trait RemoteDataGateway: Send + Sync + 'static {
    /// Ordered, filtered, paged row query
    fn query_range(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: usize,
    ) -> impl Future<Output = GatewayResult<Vec<Value>>> + Send;

    fn get_one(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = GatewayResult<Option<Value>>> + Send;

    /// Merge `patch` into every matching row; returns the number of rows touched
    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Value,
    ) -> impl Future<Output = GatewayResult<usize>> + Send;

    /// Insert one record; returns the stored row including generated columns
    fn insert(&self, table: &str, record: &Value) -> impl Future<Output = GatewayResult<Value>> + Send;

    fn delete(&self, table: &str, filters: &[Filter]) -> impl Future<Output = GatewayResult<usize>> + Send;

    /// Deliver rows inserted into `table` that match `filters` from now on
    fn subscribe_inserts(&self, table: &str, filters: &[Filter]) -> GatewayResult<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters_on_rows() {
        let row = json!({
            "device_id": "ESP32C6_001",
            "sensor_mode": "sleep",
            "created_at": "2026-10-16T10:00:00.500Z",
            "in_bed": true,
            "device_timestamp": null
        });

        assert!(Filter::eq("device_id", "ESP32C6_001").matches(&row));
        assert!(!Filter::eq("sensor_mode", "fall_detection").matches(&row));
        assert!(Filter::eq("in_bed", 1).matches(&row));
        assert!(!Filter::not_null("device_timestamp").matches(&row));
        assert!(!Filter::not_null("missing").matches(&row));
    }

    #[test]
    fn test_timestamp_comparison_ignores_precision() {
        let row = json!({ "created_at": "2026-10-16T10:00:00.5Z" });
        // Lexically "…00.5Z" < "…00Z", as instants it is later
        assert!(Filter::gt("created_at", "2026-10-16T10:00:00Z").matches(&row));
        assert!(Filter::lte("created_at", "2026-10-16T10:00:00.500+00:00").matches(&row));
    }

    #[test]
    fn test_timestamp_value_is_millis_utc() {
        let at: DateTime<Utc> = "2026-10-16T10:00:00Z".parse().unwrap();
        assert_eq!(timestamp_value(at), json!("2026-10-16T10:00:00.000Z"));
    }

    #[test]
    fn test_row_id_keeps_integer_keys_numeric() {
        let id: RowId = "42".parse().unwrap();
        assert_eq!(id, RowId::Int(42));
        assert_eq!(id.filter(), Filter::eq("id", 42));

        let id: RowId = "9b2f-uuid".parse().unwrap();
        assert_eq!(id.to_string(), "9b2f-uuid");
        assert_eq!(serde_json::from_value::<RowId>(json!("abc")).unwrap(), RowId::Text("abc".into()));
    }
}
