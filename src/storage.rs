use crate::gateway::*;
use chrono::Utc;
use rusqlite::{params, Connection, ToSql};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Embedded stand-in for the hosted backend. Every table is a set of JSON rows
/// in one SQLite table; filters are evaluated with `json_extract`.
pub struct SqliteGateway {
    conn: Mutex<Connection>,
    inserts: broadcast::Sender<(String, Value)>,
}

impl SqliteGateway {
    pub fn new<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> GatewayResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> GatewayResult<Self> {
        let (inserts, _) = broadcast::channel(1024);
        let store = Self {
            conn: Mutex::new(conn),
            inserts,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> GatewayResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| GatewayError::Poisoned)
    }

    fn initialize_schema(&self) -> GatewayResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- One row per record of any hosted table
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                data JSON NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_table ON records(table_name);
            CREATE INDEX IF NOT EXISTS idx_records_device
                ON records(table_name, json_extract(data, '$.device_id'));
            "#,
        )?;
        Ok(())
    }

    /// Insert many rows in one transaction (bulk seeding). Subscribers are notified
    /// after the commit.
    pub fn insert_batch(&self, table: &str, records: &[Value]) -> GatewayResult<usize> {
        let stored = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let mut stored = Vec::with_capacity(records.len());
            for record in records {
                stored.push(insert_row(&tx, table, record)?);
            }
            tx.commit()?;
            stored
        };

        let count = stored.len();
        for row in stored {
            let _ = self.inserts.send((table.to_string(), row));
        }
        debug!("Inserted {} rows into {}", count, table);
        Ok(count)
    }

    pub fn count(&self, table: &str) -> GatewayResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn query_sync(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: usize,
    ) -> GatewayResult<Vec<Value>> {
        let (clause, mut params_vec) = where_clause(table, filters);
        let mut query = format!("SELECT data FROM records WHERE {}", clause);

        match order {
            Some(order) => {
                // julianday() orders timestamps as instants and passes numbers through
                query.push_str(&format!(
                    " ORDER BY COALESCE(julianday(json_extract(data, ?)), json_extract(data, ?)) {}, id {}",
                    if order.ascending { "ASC" } else { "DESC" },
                    if order.ascending { "ASC" } else { "DESC" },
                ));
                params_vec.push(Box::new(json_path(&order.column)));
                params_vec.push(Box::new(json_path(&order.column)));
            }
            None => query.push_str(" ORDER BY id ASC"),
        }

        query.push_str(" LIMIT ? OFFSET ?");
        params_vec.push(Box::new(limit.map(|l| l as i64).unwrap_or(-1)));
        params_vec.push(Box::new(offset as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let data = row?;
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => records.push(value),
                Err(e) => warn!("Skipping unreadable row in {}: {}", table, e),
            }
        }
        Ok(records)
    }

    fn update_sync(&self, table: &str, filters: &[Filter], patch: &Value) -> GatewayResult<usize> {
        if !patch.is_object() {
            return Err(GatewayError::Invalid("update patch must be an object".to_string()));
        }
        let (clause, where_params) = where_clause(table, filters);
        let query = format!("UPDATE records SET data = json_patch(data, ?) WHERE {}", clause);

        let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(patch.to_string())];
        params_vec.extend(where_params);
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn()?;
        Ok(conn.execute(&query, params_refs.as_slice())?)
    }

    fn delete_sync(&self, table: &str, filters: &[Filter]) -> GatewayResult<usize> {
        let (clause, params_vec) = where_clause(table, filters);
        let query = format!("DELETE FROM records WHERE {}", clause);
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn()?;
        Ok(conn.execute(&query, params_refs.as_slice())?)
    }

    fn insert_sync(&self, table: &str, record: &Value) -> GatewayResult<Value> {
        let row = {
            let conn = self.conn()?;
            insert_row(&conn, table, record)?
        };
        let _ = self.inserts.send((table.to_string(), row.clone()));
        Ok(row)
    }
}

/// Store one record, filling the generated `id` and `created_at` columns the
/// hosted tables provide.
fn insert_row(conn: &Connection, table: &str, record: &Value) -> GatewayResult<Value> {
    let mut row = match record {
        Value::Object(map) => map.clone(),
        _ => return Err(GatewayError::Invalid("insert record must be an object".to_string())),
    };
    row.entry("created_at")
        .or_insert_with(|| timestamp_value(Utc::now()));

    conn.execute(
        "INSERT INTO records (table_name, data) VALUES (?1, ?2)",
        params![table, Value::Object(row.clone()).to_string()],
    )?;

    if !row.contains_key("id") {
        let id = conn.last_insert_rowid();
        row.insert("id".to_string(), Value::from(id));
        conn.execute(
            "UPDATE records SET data = json_set(data, '$.id', ?1) WHERE id = ?1",
            params![id],
        )?;
    }

    Ok(Value::Object(row))
}

fn json_path(column: &str) -> String {
    format!("$.{}", column)
}

fn sql_value(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::String(s) => Box::new(s.clone()),
        Value::Bool(b) => Box::new(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Box::new(i),
            None => Box::new(n.as_f64().unwrap_or_default()),
        },
        other => Box::new(other.to_string()),
    }
}

fn where_clause(table: &str, filters: &[Filter]) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clause = String::from("table_name = ?");
    let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(table.to_string())];

    for filter in filters {
        let path = json_path(filter.column());
        let (op, value) = match filter {
            Filter::NotNull(_) => {
                clause.push_str(" AND json_extract(data, ?) IS NOT NULL");
                params_vec.push(Box::new(path));
                continue;
            }
            Filter::Eq(_, Value::Null) => {
                clause.push_str(" AND json_extract(data, ?) IS NULL");
                params_vec.push(Box::new(path));
                continue;
            }
            Filter::Eq(_, v) => ("=", v),
            Filter::Gt(_, v) => (">", v),
            Filter::Gte(_, v) => (">=", v),
            Filter::Lte(_, v) => ("<=", v),
        };

        if value.is_string() && op != "=" {
            // Range filters on strings are timestamp ranges
            clause.push_str(&format!(" AND julianday(json_extract(data, ?)) {} julianday(?)", op));
        } else {
            clause.push_str(&format!(" AND json_extract(data, ?) {} ?", op));
        }
        params_vec.push(Box::new(path));
        params_vec.push(sql_value(value));
    }

    (clause, params_vec)
}

impl RemoteDataGateway for SqliteGateway {
    async fn query_range(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: usize,
    ) -> GatewayResult<Vec<Value>> {
        self.query_sync(table, filters, order, limit, offset)
    }

    async fn get_one(&self, table: &str, filters: &[Filter]) -> GatewayResult<Option<Value>> {
        Ok(self.query_sync(table, filters, None, Some(1), 0)?.into_iter().next())
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: &Value) -> GatewayResult<usize> {
        self.update_sync(table, filters, patch)
    }

    async fn insert(&self, table: &str, record: &Value) -> GatewayResult<Value> {
        self.insert_sync(table, record)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> GatewayResult<usize> {
        self.delete_sync(table, filters)
    }

    fn subscribe_inserts(&self, table: &str, filters: &[Filter]) -> GatewayResult<Subscription> {
        let mut inserts = self.inserts.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let table = table.to_string();
        let filters = filters.to_vec();

        let task = tokio::spawn(async move {
            loop {
                match inserts.recv().await {
                    Ok((inserted_into, row)) => {
                        if inserted_into == table && matches_all(&filters, &row) && tx.send(row).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Insert feed for {} lagged, {} rows skipped", table, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading_row(ts: &str, mode: &str) -> Value {
        json!({
            "device_id": "ESP32C6_001",
            "sensor_mode": mode,
            "device_timestamp": ts,
            "created_at": ts,
            "human_existence": 1
        })
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_created_at() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let row = gateway
            .insert(AUDIT_TABLE, &json!({ "action": "mode_switch" }))
            .await
            .unwrap();

        assert_eq!(row["id"], json!(1));
        assert!(row["created_at"].is_string());

        let stored = gateway
            .get_one(AUDIT_TABLE, &[Filter::eq("id", 1)])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["action"], "mode_switch");
        assert_eq!(stored["id"], json!(1));
    }

    #[tokio::test]
    async fn test_range_query_orders_and_pages() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let rows = vec![
            reading_row("2026-10-16T10:00:00Z", "sleep"),
            reading_row("2026-10-16T10:00:00.5Z", "sleep"),
            reading_row("2026-10-16T10:00:01Z", "fall_detection"),
            reading_row("2026-10-16T09:59:59Z", "sleep"),
        ];
        gateway.insert_batch(READINGS_TABLE, &rows).unwrap();

        let filters = [
            Filter::eq("device_id", "ESP32C6_001"),
            Filter::eq("sensor_mode", "sleep"),
            Filter::gte("device_timestamp", "2026-10-16T10:00:00.000Z"),
        ];
        let order = Order::desc("device_timestamp");

        let first = gateway
            .query_range(READINGS_TABLE, &filters, Some(&order), Some(1), 0)
            .await
            .unwrap();
        let second = gateway
            .query_range(READINGS_TABLE, &filters, Some(&order), Some(1), 1)
            .await
            .unwrap();
        let third = gateway
            .query_range(READINGS_TABLE, &filters, Some(&order), Some(1), 2)
            .await
            .unwrap();

        assert_eq!(first[0]["device_timestamp"], "2026-10-16T10:00:00.5Z");
        assert_eq!(second[0]["device_timestamp"], "2026-10-16T10:00:00Z");
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_and_delete_removes() {
        let gateway = SqliteGateway::in_memory().unwrap();
        gateway
            .insert(
                DEVICES_TABLE,
                &json!({ "device_id": "ESP32C6_001", "operational_mode": "sleep", "fall_sensitivity": 5 }),
            )
            .await
            .unwrap();

        let touched = gateway
            .update(
                DEVICES_TABLE,
                &[Filter::eq("device_id", "ESP32C6_001")],
                &json!({ "operational_mode": "fall_detection", "config_updated": true }),
            )
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let device = gateway
            .get_one(DEVICES_TABLE, &[Filter::eq("device_id", "ESP32C6_001")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device["operational_mode"], "fall_detection");
        assert_eq!(device["config_updated"], json!(true));
        assert_eq!(device["fall_sensitivity"], json!(5));

        let removed = gateway
            .delete(DEVICES_TABLE, &[Filter::eq("device_id", "ESP32C6_001")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(gateway.count(DEVICES_TABLE).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscription_delivers_matching_inserts() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let mut subscription = gateway
            .subscribe_inserts(READINGS_TABLE, &[Filter::eq("device_id", "ESP32C6_001")])
            .unwrap();

        let mut other = reading_row("2026-10-16T10:00:00Z", "sleep");
        other["device_id"] = json!("OTHER");
        gateway.insert(READINGS_TABLE, &other).await.unwrap();
        gateway.insert(ANNOTATIONS_TABLE, &json!({ "device_id": "ESP32C6_001" })).await.unwrap();
        gateway
            .insert(READINGS_TABLE, &reading_row("2026-10-16T10:00:03Z", "sleep"))
            .await
            .unwrap();

        let row = subscription.recv().await.unwrap();
        assert_eq!(row["device_timestamp"], "2026-10-16T10:00:03Z");
    }
}
