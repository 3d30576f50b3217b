use crate::annotations::{self, AnnotationInput};
use crate::audit::{self, AuditFilter, AuditRecorder};
use crate::buffers::WindowName;
use crate::engine::EngineHandle;
use crate::gateway::{GatewayError, RemoteDataGateway, RowId};
use crate::metrics::SensorMode;
use crate::settings::{self, DeviceCommand, DeviceSettings};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Annotations shown on the 12-hour timeline
const ANNOTATION_HORIZON_HOURS: i64 = 12;

pub struct AppState<G: RemoteDataGateway> {
    pub engine: EngineHandle,
    pub gateway: Arc<G>,
    pub device_id: String,
    pub audit: AuditRecorder,
}

type SharedState<G> = Arc<AppState<G>>;

pub fn router<G: RemoteDataGateway>(state: AppState<G>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(dashboard_handler))
        .route("/api/view", get(view_handler::<G>))
        .route("/api/timeline/:window", get(timeline_handler::<G>))
        .route("/api/mode", post(mode_handler::<G>))
        .route("/api/reload", post(reload_handler::<G>))
        .route("/api/settings", get(get_settings_handler::<G>).put(put_settings_handler::<G>))
        .route("/api/settings/reset", post(reset_settings_handler))
        .route("/api/command", post(command_handler::<G>))
        .route(
            "/api/annotations",
            get(list_annotations_handler::<G>).post(create_annotation_handler::<G>),
        )
        .route(
            "/api/annotations/:id",
            put(update_annotation_handler::<G>).delete(delete_annotation_handler::<G>),
        )
        .route("/api/audit", get(audit_handler::<G>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn start_web_server<G: RemoteDataGateway>(state: AppState<G>, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Web server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn success<T: Serialize>(data: T) -> Response {
    Json(serde_json::json!({
        "success": true,
        "data": data
    }))
    .into_response()
}

fn failure(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": error.to_string()
        })),
    )
        .into_response()
}

fn gateway_failure(e: GatewayError) -> Response {
    match e {
        GatewayError::Invalid(_) => failure(StatusCode::BAD_REQUEST, e),
        _ => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

fn parse_row_id(raw: &str) -> RowId {
    match raw.parse() {
        Ok(id) => id,
        Err(never) => match never {},
    }
}

async fn dashboard_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn view_handler<G: RemoteDataGateway>(State(state): State<SharedState<G>>) -> Response {
    let view = state.engine.view();
    success(&*view)
}

async fn timeline_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Path(window): Path<String>,
) -> Response {
    let view = state.engine.view();
    match WindowName::from_slug(&window) {
        Some(WindowName::Latest) => success(&view.latest),
        Some(WindowName::Hour) => success(&view.hour),
        Some(WindowName::TwelveHour) => success(&view.twelve_hour),
        Some(WindowName::TwentyFourHour) => success(&view.twenty_four_hour),
        None => failure(StatusCode::NOT_FOUND, format!("unknown window '{}'", window)),
    }
}

async fn reload_handler<G: RemoteDataGateway>(State(state): State<SharedState<G>>) -> Response {
    state.engine.reload_all();
    success(serde_json::json!({ "reloading": true }))
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: SensorMode,
}

async fn mode_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Json(request): Json<ModeRequest>,
) -> Response {
    // The local switch has already happened when the device write fails
    match state.engine.switch_mode(request.mode).await {
        Ok(()) => success(request.mode),
        Err(e) => failure(StatusCode::BAD_GATEWAY, e),
    }
}

async fn get_settings_handler<G: RemoteDataGateway>(State(state): State<SharedState<G>>) -> Response {
    match settings::load_settings(state.gateway.as_ref(), &state.device_id).await {
        Ok(Some(current)) => success(current),
        Ok(None) => failure(
            StatusCode::NOT_FOUND,
            format!("no device record for {}", state.device_id),
        ),
        Err(e) => gateway_failure(e),
    }
}

async fn put_settings_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Json(updated): Json<DeviceSettings>,
) -> Response {
    if let Err(e) = updated.validate() {
        return failure(StatusCode::BAD_REQUEST, e);
    }

    match state.engine.save_settings(updated.clone()).await {
        Ok(()) => success(updated),
        Err(e) => failure(StatusCode::BAD_GATEWAY, e),
    }
}

/// Factory defaults for the form; nothing is written until the user saves
async fn reset_settings_handler() -> Response {
    success(DeviceSettings::default())
}

#[derive(Deserialize)]
struct CommandRequest {
    command: DeviceCommand,
}

async fn command_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Json(request): Json<CommandRequest>,
) -> Response {
    match state.engine.send_command(request.command).await {
        Ok(()) => success(serde_json::json!({
            "command": request.command,
            "label": request.command.label()
        })),
        Err(e) => failure(StatusCode::BAD_GATEWAY, e),
    }
}

async fn list_annotations_handler<G: RemoteDataGateway>(State(state): State<SharedState<G>>) -> Response {
    match annotations::list_recent(
        state.gateway.as_ref(),
        &state.device_id,
        Utc::now(),
        TimeDelta::hours(ANNOTATION_HORIZON_HOURS),
    )
    .await
    {
        Ok(list) => success(list),
        Err(e) => gateway_failure(e),
    }
}

async fn create_annotation_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Json(input): Json<AnnotationInput>,
) -> Response {
    let result = annotations::create(state.gateway.as_ref(), &state.device_id, input).await;

    let resource_id = match &result {
        Ok(created) => created.id.as_ref().map(|id| id.to_string()).unwrap_or_default(),
        Err(_) => String::new(),
    };
    let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
    state
        .audit
        .record(state.gateway.as_ref(), "create_annotation", "annotation", &resource_id, outcome)
        .await;

    match result {
        Ok(created) => (StatusCode::CREATED, Json(serde_json::json!({ "success": true, "data": created }))).into_response(),
        Err(e) => gateway_failure(e),
    }
}

async fn update_annotation_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Path(raw_id): Path<String>,
    Json(input): Json<AnnotationInput>,
) -> Response {
    let id = parse_row_id(&raw_id);
    let result = annotations::update(state.gateway.as_ref(), &id, &state.device_id, input).await;

    let outcome = match &result {
        Ok(true) => Ok(()),
        Ok(false) => Err("annotation not found".to_string()),
        Err(e) => Err(e.to_string()),
    };
    state
        .audit
        .record(state.gateway.as_ref(), "update_annotation", "annotation", &raw_id, outcome)
        .await;

    match result {
        Ok(true) => success(serde_json::json!({ "id": id })),
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("annotation {} not found", raw_id)),
        Err(e) => gateway_failure(e),
    }
}

async fn delete_annotation_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = parse_row_id(&raw_id);
    let result = annotations::delete(state.gateway.as_ref(), &id).await;

    let outcome = match &result {
        Ok(true) => Ok(()),
        Ok(false) => Err("annotation not found".to_string()),
        Err(e) => Err(e.to_string()),
    };
    state
        .audit
        .record(state.gateway.as_ref(), "delete_annotation", "annotation", &raw_id, outcome)
        .await;

    match result {
        Ok(true) => success(serde_json::json!({ "id": id })),
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("annotation {} not found", raw_id)),
        Err(e) => gateway_failure(e),
    }
}

async fn audit_handler<G: RemoteDataGateway>(
    State(state): State<SharedState<G>>,
    Query(filter): Query<AuditFilter>,
) -> Response {
    match audit::list(state.gateway.as_ref(), &filter).await {
        Ok(entries) => Json(serde_json::json!({
            "success": true,
            "count": entries.len(),
            "data": entries
        }))
        .into_response(),
        Err(e) => gateway_failure(e),
    }
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>moveOmeter - Live Dashboard</title>
    <script src="https://cdn.jsdelivr.net/npm/chart.js"></script>
    <script src="https://cdn.jsdelivr.net/npm/chartjs-adapter-date-fns"></script>
    <script src="https://cdn.tailwindcss.com"></script>
    <style>
        .status-online { color: #10b981; }
        .status-stale { color: #f59e0b; }
        .status-offline { color: #ef4444; }
        .status-waiting { color: #9ca3af; }
        .chart-container { position: relative; height: 250px; }
    </style>
</head>
<body class="bg-gray-900 text-gray-100 min-h-screen">
    <div class="container mx-auto px-4 py-6">
        <header class="mb-8 flex justify-between items-start">
            <div>
                <h1 class="text-3xl font-bold text-white mb-2">moveOmeter</h1>
                <p class="text-gray-400"><span id="device-id">--</span> &middot; <span id="mode-label">--</span></p>
            </div>
            <div class="bg-gray-800 rounded-lg p-4 border border-gray-700 text-right">
                <div id="liveness" class="text-xl font-bold status-waiting">Waiting</div>
                <div id="last-seen" class="text-gray-500 text-sm">No data yet</div>
                <div class="mt-3 space-x-2">
                    <button onclick="switchMode('sleep')" class="bg-blue-600 hover:bg-blue-700 px-3 py-1 rounded text-sm">Sleep</button>
                    <button onclick="switchMode('fall_detection')" class="bg-blue-600 hover:bg-blue-700 px-3 py-1 rounded text-sm">Fall Detection</button>
                </div>
            </div>
        </header>

        <div id="alerts" class="mb-6 space-y-2"></div>
        <div id="cards" class="grid grid-cols-2 md:grid-cols-3 lg:grid-cols-5 gap-4 mb-8"></div>

        <div class="grid grid-cols-1 lg:grid-cols-2 gap-6">
            <div class="bg-gray-800 rounded-lg p-4 border border-gray-700">
                <h2 class="text-lg font-semibold mb-2">Real-time</h2>
                <div class="chart-container"><canvas id="latest-chart"></canvas></div>
            </div>
            <div class="bg-gray-800 rounded-lg p-4 border border-gray-700">
                <h2 class="text-lg font-semibold mb-2">Last Hour</h2>
                <div class="chart-container"><canvas id="hour-chart"></canvas></div>
            </div>
            <div class="bg-gray-800 rounded-lg p-4 border border-gray-700">
                <h2 class="text-lg font-semibold mb-2">12 Hours (5 min)</h2>
                <div class="chart-container"><canvas id="twelve-chart"></canvas></div>
            </div>
            <div class="bg-gray-800 rounded-lg p-4 border border-gray-700">
                <h2 class="text-lg font-semibold mb-2">24 Hours (10 min)</h2>
                <div class="chart-container"><canvas id="twentyfour-chart"></canvas></div>
            </div>
        </div>
    </div>

    <script>
        const charts = {};
        const primary = { sleep: 'heart_rate_bpm', fall_detection: 'body_movement' };

        function lineChart(id) {
            return new Chart(document.getElementById(id), {
                type: 'line',
                data: { datasets: [{ data: [], borderColor: '#3b82f6', pointRadius: 0, tension: 0.2 }] },
                options: {
                    animation: false,
                    maintainAspectRatio: false,
                    plugins: { legend: { display: false } },
                    scales: { x: { type: 'time', ticks: { color: '#9ca3af' } }, y: { ticks: { color: '#9ca3af' } } }
                }
            });
        }

        function setSeries(chart, points) {
            chart.data.datasets[0].data = points;
            chart.update('none');
        }

        function rawPoints(readings, field) {
            return readings.map(r => ({ x: r.device_timestamp || r.created_at, y: r[field] || 0 }));
        }

        function bucketPoints(timeline, field) {
            return timeline.points.map(p => ({ x: p.bucket_start, y: p.values[field] || 0 }));
        }

        function render(view) {
            const field = primary[view.mode];
            document.getElementById('device-id').textContent = view.device_id;
            document.getElementById('mode-label').textContent = view.mode_label + (view.mode_confirmed ? '' : ' (detecting)');

            const liveness = document.getElementById('liveness');
            liveness.textContent = view.liveness.charAt(0).toUpperCase() + view.liveness.slice(1);
            liveness.className = 'text-xl font-bold status-' + view.liveness;
            document.getElementById('last-seen').textContent = view.last_seen
                ? 'Last seen ' + new Date(view.last_seen).toLocaleTimeString()
                : 'No data yet';

            document.getElementById('cards').innerHTML = Object.entries(view.metrics.values).map(([name, value]) => `
                <div class="bg-gray-800 rounded-lg p-4 border border-gray-700">
                    <h3 class="text-gray-400 text-sm font-medium mb-1">${name.replace(/_/g, ' ')}</h3>
                    <span class="text-2xl font-bold">${value}</span>
                </div>`).join('');

            document.getElementById('alerts').innerHTML = view.alerts.map(a => `
                <div class="rounded px-4 py-2 ${a.severity === 'critical' ? 'bg-red-700' : 'bg-yellow-700'}">${a.message}</div>`).join('');

            setSeries(charts.latest, rawPoints(view.latest, field));
            setSeries(charts.hour, rawPoints(view.hour, field));
            setSeries(charts.twelve, bucketPoints(view.twelve_hour, field));
            setSeries(charts.twentyfour, bucketPoints(view.twenty_four_hour, field));
        }

        async function refresh() {
            try {
                const response = await fetch('/api/view');
                const body = await response.json();
                if (body.success) render(body.data);
            } catch (e) {
                console.error('Failed to load view', e);
            }
        }

        async function switchMode(mode) {
            const response = await fetch('/api/mode', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ mode })
            });
            const body = await response.json();
            if (!body.success) alert('Mode switch not saved on device: ' + body.error);
            refresh();
        }

        charts.latest = lineChart('latest-chart');
        charts.hour = lineChart('hour-chart');
        charts.twelve = lineChart('twelve-chart');
        charts.twentyfour = lineChart('twentyfour-chart');
        refresh();
        setInterval(refresh, 2000);
    </script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardConfig;
    use crate::engine::DashboardEngine;
    use crate::gateway::{Filter, ANNOTATIONS_TABLE, AUDIT_TABLE};
    use crate::storage::SqliteGateway;
    use axum::body::to_bytes;
    use serde_json::Value;

    fn state() -> AppState<SqliteGateway> {
        let gateway = Arc::new(SqliteGateway::in_memory().unwrap());
        let (_engine, handle) = DashboardEngine::new(gateway.clone(), DashboardConfig::default());
        AppState {
            engine: handle,
            gateway,
            device_id: "ESP32C6_001".to_string(),
            audit: AuditRecorder::new("tester"),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_offline_view_carries_zeroed_cards() {
        let shared = Arc::new(state());
        let body = body_json(view_handler(State(shared)).await).await;
        let metrics = &body["data"]["metrics"];
        assert_eq!(metrics["live"], false);
        let values = metrics["values"].as_object().unwrap();
        assert!(!values.is_empty());
        assert!(values.values().all(|v| v.as_f64() == Some(0.0)));

        let Html(page) = dashboard_handler().await;
        assert!(page.contains("font-bold\">${value}</span>"));
        assert!(!page.contains("'--'"));
    }

    #[tokio::test]
    async fn test_unknown_timeline_is_not_found() {
        let shared = Arc::new(state());
        let response = timeline_handler(State(shared), Path("7d".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_reset_returns_factory_defaults() {
        let body = body_json(reset_settings_handler().await).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["heart_rate_alert_max"], 100);
        assert_eq!(body["data"]["supplemental_cycle_mode"], "rotating");
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_write() {
        let shared = Arc::new(state());
        let updated = DeviceSettings {
            heart_rate_alert_min: 120,
            heart_rate_alert_max: 100,
            ..DeviceSettings::default()
        };

        let response = put_settings_handler(State(shared), Json(updated)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_annotation_lifecycle_is_audited() {
        let shared = Arc::new(state());
        let input: AnnotationInput = serde_json::from_value(serde_json::json!({
            "annotation_timestamp": Utc::now(),
            "title": "Took medication"
        }))
        .unwrap();

        let response = create_annotation_handler(State(shared.clone()), Json(input)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = match &created["data"]["id"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => panic!("unexpected id {:?}", other),
        };

        let listed = body_json(list_annotations_handler(State(shared.clone())).await).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let response = delete_annotation_handler(State(shared.clone()), Path(id.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = delete_annotation_handler(State(shared.clone()), Path(id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(shared.gateway.count(ANNOTATIONS_TABLE).unwrap(), 0);
        let failed = shared
            .gateway
            .query_range(AUDIT_TABLE, &[Filter::eq("success", false)], None, None, 0)
            .await
            .unwrap();
        assert_eq!(shared.gateway.count(AUDIT_TABLE).unwrap(), 3);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["action"], "delete_annotation");
    }
}
