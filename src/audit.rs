use crate::gateway::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

pub const AUDIT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Writes audit entries on behalf of one dashboard session. Failures are
/// logged and never reach the caller.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    user_id: String,
    user_agent: String,
}

impl AuditRecorder {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_agent: format!(
                "{}/{} session {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                Uuid::new_v4()
            ),
        }
    }

    pub fn entry(&self, action: &str, resource_type: &str, resource_id: &str, outcome: Result<(), String>) -> AuditEntry {
        AuditEntry {
            id: None,
            created_at: None,
            user_id: self.user_id.clone(),
            action: action.to_string(),
            resource_type: Some(resource_type.to_string()),
            resource_id: Some(resource_id.to_string()),
            user_agent: Some(self.user_agent.clone()),
            success: outcome.is_ok(),
            error_message: outcome.err(),
        }
    }

    pub async fn record<G: RemoteDataGateway>(
        &self,
        gateway: &G,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        outcome: Result<(), String>,
    ) {
        let entry = self.entry(action, resource_type, resource_id, outcome);
        let record = match serde_json::to_value(&entry) {
            Ok(record) => record,
            Err(e) => {
                error!("Audit log error: {}", e);
                return;
            }
        };

        match gateway.insert(AUDIT_TABLE, &record).await {
            Ok(_) => debug!(action, resource_type, resource_id, success = entry.success, "Audit entry written"),
            Err(e) => error!("Audit log error: {}", e),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if let Some(user_id) = &self.user_id {
            filters.push(Filter::eq("user_id", user_id.as_str()));
        }
        if let Some(action) = &self.action {
            filters.push(Filter::eq("action", action.as_str()));
        }
        if let Some(success) = self.success {
            filters.push(Filter::eq("success", success));
        }
        if let Some(since) = self.since {
            filters.push(Filter::gte("created_at", timestamp_value(since)));
        }
        filters
    }
}

/// Newest entries first, at most [`AUDIT_LIST_LIMIT`]
pub async fn list<G: RemoteDataGateway>(gateway: &G, filter: &AuditFilter) -> GatewayResult<Vec<AuditEntry>> {
    let rows = gateway
        .query_range(
            AUDIT_TABLE,
            &filter.filters(),
            Some(&Order::desc("created_at")),
            Some(AUDIT_LIST_LIMIT),
            0,
        )
        .await?;

    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(GatewayError::from))
        .collect()
}

fn csv_cell(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("\"{}\"", collapsed.replace('"', "\"\""))
}

pub fn to_csv(entries: &[AuditEntry]) -> String {
    let mut lines = vec![["Timestamp", "User", "Action", "Resource", "Status", "Error"]
        .iter()
        .map(|h| csv_cell(h))
        .collect::<Vec<_>>()
        .join(",")];

    for entry in entries {
        let resource = [entry.resource_type.as_deref(), entry.resource_id.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        let cells = [
            entry.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            entry.user_id.clone(),
            entry.action.clone(),
            if resource.is_empty() { "-".to_string() } else { resource },
            if entry.success { "Success" } else { "Failed" }.to_string(),
            entry.error_message.clone().unwrap_or_else(|| "-".to_string()),
        ];
        lines.push(cells.iter().map(|c| csv_cell(c)).collect::<Vec<_>>().join(","));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteGateway;

    #[test]
    fn test_csv_quotes_and_collapses_whitespace() {
        let recorder = AuditRecorder::new("ops");
        let mut entry = recorder.entry(
            "switch_mode",
            "device",
            "ESP32C6_001",
            Err("remote said \"no\"\n  try again".to_string()),
        );
        entry.created_at = Some("2026-10-16T12:00:00Z".parse().unwrap());

        let csv = to_csv(&[entry]);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "\"Timestamp\",\"User\",\"Action\",\"Resource\",\"Status\",\"Error\"");
        assert_eq!(
            lines[1],
            "\"2026-10-16T12:00:00+00:00\",\"ops\",\"switch_mode\",\"device ESP32C6_001\",\"Failed\",\"remote said \"\"no\"\" try again\""
        );
    }

    #[tokio::test]
    async fn test_record_and_filter() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let recorder = AuditRecorder::new("ops");

        recorder.record(&gateway, "save_settings", "device", "ESP32C6_001", Ok(())).await;
        recorder
            .record(&gateway, "send_command", "device", "ESP32C6_001", Err("offline".into()))
            .await;
        AuditRecorder::new("someone")
            .record(&gateway, "save_settings", "device", "ESP32C6_001", Ok(()))
            .await;

        let all = list(&gateway, &AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|e| e.created_at.is_some()));

        let failed = list(
            &gateway,
            &AuditFilter {
                success: Some(false),
                ..AuditFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("offline"));

        let mine = list(
            &gateway,
            &AuditFilter {
                user_id: Some("ops".into()),
                action: Some("save_settings".into()),
                ..AuditFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].user_agent.as_deref().unwrap().contains("session"));
    }
}
