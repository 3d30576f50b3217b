use crate::gateway::*;
use chrono::Utc;
use reqwest::{header, Client, Method, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

/// Gateway speaking the PostgREST dialect used by the hosted backend
/// (`/rest/v1/<table>?column=op.value`).
#[derive(Clone)]
pub struct RestGateway {
    client: Client,
    base_url: String,
    api_key: String,
    feed_interval: Duration,
}

impl RestGateway {
    pub fn new(base_url: &str, api_key: &str, feed_interval: Duration) -> GatewayResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            feed_interval,
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
    }

    async fn send(request: RequestBuilder) -> GatewayResult<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                message: body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: usize,
    ) -> GatewayResult<Vec<Value>> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        query.extend(filter_params(filters));
        if let Some(order) = order {
            query.push((
                "order".to_string(),
                format!("{}.{}", order.column, if order.ascending { "asc" } else { "desc" }),
            ));
        }
        if let Some(limit) = limit {
            query.push(("limit".to_string(), limit.to_string()));
        }
        if offset > 0 {
            query.push(("offset".to_string(), offset.to_string()));
        }

        match Self::send(self.request(Method::GET, table).query(&query)).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(GatewayError::Invalid(format!("expected row array, got {}", other))),
        }
    }
}

/// Render a scalar the way PostgREST expects it after the operator
fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| {
            let rendered = match filter {
                Filter::Eq(_, Value::Null) => "is.null".to_string(),
                Filter::Eq(_, v) => format!("eq.{}", param_value(v)),
                Filter::Gt(_, v) => format!("gt.{}", param_value(v)),
                Filter::Gte(_, v) => format!("gte.{}", param_value(v)),
                Filter::Lte(_, v) => format!("lte.{}", param_value(v)),
                Filter::NotNull(_) => "not.is.null".to_string(),
            };
            (filter.column().to_string(), rendered)
        })
        .collect()
}

fn returned_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl RemoteDataGateway for RestGateway {
    async fn query_range(
        &self,
        table: &str,
        filters: &[Filter],
        order: Option<&Order>,
        limit: Option<usize>,
        offset: usize,
    ) -> GatewayResult<Vec<Value>> {
        self.fetch(table, filters, order, limit, offset).await
    }

    async fn get_one(&self, table: &str, filters: &[Filter]) -> GatewayResult<Option<Value>> {
        Ok(self.fetch(table, filters, None, Some(1), 0).await?.into_iter().next())
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: &Value) -> GatewayResult<usize> {
        let request = self
            .request(Method::PATCH, table)
            .query(&filter_params(filters))
            .header("Prefer", "return=representation")
            .json(patch);
        Ok(returned_rows(Self::send(request).await?).len())
    }

    async fn insert(&self, table: &str, record: &Value) -> GatewayResult<Value> {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(record);
        returned_rows(Self::send(request).await?)
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Invalid(format!("insert into {} returned no row", table)))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> GatewayResult<usize> {
        let request = self
            .request(Method::DELETE, table)
            .query(&filter_params(filters))
            .header("Prefer", "return=representation");
        Ok(returned_rows(Self::send(request).await?).len())
    }

    /// The hosted push channel is a websocket protocol; this gateway follows new
    /// rows by polling on `created_at` instead.
    fn subscribe_inserts(&self, table: &str, filters: &[Filter]) -> GatewayResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = self.clone();
        let table = table.to_string();
        let filters = filters.to_vec();

        let task = tokio::spawn(async move {
            let mut high_water = timestamp_value(Utc::now());
            let mut interval = time::interval(gateway.feed_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let mut query = filters.clone();
                query.push(Filter::gt("created_at", high_water.clone()));

                match gateway
                    .fetch(&table, &query, Some(&Order::asc("created_at")), Some(1000), 0)
                    .await
                {
                    Ok(rows) => {
                        if !rows.is_empty() {
                            debug!("Insert feed for {}: {} new rows", table, rows.len());
                        }
                        for row in rows {
                            if let Some(created) = row.get("created_at") {
                                high_water = created.clone();
                            }
                            if tx.send(row).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Insert feed for {} failed: {}", table, e),
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

    #[test]
    fn test_filter_params_use_postgrest_operators() {
        let params = filter_params(&[
            Filter::eq("device_id", "ESP32C6_001"),
            Filter::gte("device_timestamp", "2026-10-16T10:00:00.000Z"),
            Filter::not_null("device_timestamp"),
            Filter::eq("success", true),
            Filter::Eq("pending_command".to_string(), Value::Null),
        ]);

        assert_eq!(
            params,
            vec![
                ("device_id".to_string(), "eq.ESP32C6_001".to_string()),
                ("device_timestamp".to_string(), "gte.2026-10-16T10:00:00.000Z".to_string()),
                ("device_timestamp".to_string(), "not.is.null".to_string()),
                ("success".to_string(), "eq.true".to_string()),
                ("pending_command".to_string(), "is.null".to_string()),
            ]
        );
    }

    #[test]
    fn test_returned_rows_shapes() {
        assert_eq!(returned_rows(json!([{ "id": 1 }, { "id": 2 }])).len(), 2);
        assert_eq!(returned_rows(json!({ "id": 1 })).len(), 1);
        assert!(returned_rows(Value::Null).is_empty());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let gateway = RestGateway::new("https://example.invalid/", "key", Duration::from_secs(3)).unwrap();
        assert_eq!(gateway.base_url, "https://example.invalid");
    }
}
