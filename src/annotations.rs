use crate::gateway::*;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
    pub device_id: String,
    pub annotation_timestamp: DateTime<Utc>,
    pub annotation_type: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// Editable fields of an annotation, as submitted by the page
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationInput {
    pub annotation_timestamp: DateTime<Utc>,
    #[serde(default = "default_annotation_type")]
    pub annotation_type: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

fn default_annotation_type() -> String {
    "note".to_string()
}

impl AnnotationInput {
    fn into_annotation(self, device_id: &str) -> GatewayResult<Annotation> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(GatewayError::Invalid("annotation title is required".to_string()));
        }

        Ok(Annotation {
            id: None,
            device_id: device_id.to_string(),
            annotation_timestamp: self.annotation_timestamp,
            annotation_type: self.annotation_type,
            title,
            description: self.description.filter(|d| !d.trim().is_empty()),
            color: self.color,
            icon: self.icon,
        })
    }
}

/// Annotations of the last `horizon` (12 h on the timeline), newest first
pub async fn list_recent<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    now: DateTime<Utc>,
    horizon: TimeDelta,
) -> GatewayResult<Vec<Annotation>> {
    let rows = gateway
        .query_range(
            ANNOTATIONS_TABLE,
            &[
                Filter::eq("device_id", device_id),
                Filter::gte("annotation_timestamp", timestamp_value(now - horizon)),
            ],
            Some(&Order::desc("annotation_timestamp")),
            None,
            0,
        )
        .await?;

    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(GatewayError::from))
        .collect()
}

pub async fn create<G: RemoteDataGateway>(
    gateway: &G,
    device_id: &str,
    input: AnnotationInput,
) -> GatewayResult<Annotation> {
    let annotation = input.into_annotation(device_id)?;
    let row = gateway
        .insert(ANNOTATIONS_TABLE, &serde_json::to_value(&annotation)?)
        .await?;
    let created: Annotation = serde_json::from_value(row)?;
    info!("Created annotation {:?} at {}", created.title, created.annotation_timestamp);
    Ok(created)
}

/// Returns `false` when no annotation has that id
pub async fn update<G: RemoteDataGateway>(
    gateway: &G,
    id: &RowId,
    device_id: &str,
    input: AnnotationInput,
) -> GatewayResult<bool> {
    let annotation = input.into_annotation(device_id)?;
    let mut patch = serde_json::to_value(&annotation)?;
    if let Value::Object(map) = &mut patch {
        map.remove("id");
    }

    let updated = gateway.update(ANNOTATIONS_TABLE, &[id.filter()], &patch).await?;
    Ok(updated > 0)
}

pub async fn delete<G: RemoteDataGateway>(gateway: &G, id: &RowId) -> GatewayResult<bool> {
    let deleted = gateway.delete(ANNOTATIONS_TABLE, &[id.filter()]).await?;
    if deleted > 0 {
        info!("Deleted annotation {}", id);
    }
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteGateway;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn input(title: &str, when: &str) -> AnnotationInput {
        AnnotationInput {
            annotation_timestamp: at(when),
            annotation_type: "note".to_string(),
            title: title.to_string(),
            description: None,
            color: Some("#667eea".to_string()),
            icon: None,
        }
    }

    #[tokio::test]
    async fn test_list_is_recent_and_newest_first() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let now = at("2026-10-16T12:00:00Z");

        create(&gateway, "ESP32C6_001", input("Dinner", "2026-10-16T08:00:00Z")).await.unwrap();
        create(&gateway, "ESP32C6_001", input("Medication", "2026-10-16T11:00:00Z")).await.unwrap();
        create(&gateway, "ESP32C6_001", input("Yesterday", "2026-10-15T20:00:00Z")).await.unwrap();
        create(&gateway, "OTHER", input("Elsewhere", "2026-10-16T11:30:00Z")).await.unwrap();

        let list = list_recent(&gateway, "ESP32C6_001", now, TimeDelta::hours(12)).await.unwrap();
        let titles: Vec<_> = list.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Medication", "Dinner"]);
        assert!(list.iter().all(|a| a.id.is_some()));
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let now = at("2026-10-16T12:00:00Z");
        let created = create(&gateway, "ESP32C6_001", input("Nap", "2026-10-16T10:00:00Z")).await.unwrap();
        let id = created.id.clone().unwrap();

        assert!(update(&gateway, &id, "ESP32C6_001", input("Long nap", "2026-10-16T10:15:00Z")).await.unwrap());
        let list = list_recent(&gateway, "ESP32C6_001", now, TimeDelta::hours(12)).await.unwrap();
        assert_eq!(list[0].title, "Long nap");
        assert_eq!(list[0].annotation_timestamp, at("2026-10-16T10:15:00Z"));
        assert_eq!(list[0].id, Some(id.clone()));

        assert!(delete(&gateway, &id).await.unwrap());
        assert!(!delete(&gateway, &id).await.unwrap());
        assert!(list_recent(&gateway, "ESP32C6_001", now, TimeDelta::hours(12)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_title_rejected() {
        let gateway = SqliteGateway::in_memory().unwrap();
        let result = create(&gateway, "ESP32C6_001", input("  ", "2026-10-16T10:00:00Z")).await;
        assert!(matches!(result, Err(GatewayError::Invalid(_))));
    }
}
