//! Axum admin surface: run triggers, operator cancels, the audit read API and
//! an HTML status dashboard.

use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fedsync_core::{SyncMode, SyncStatus, SyncType};
use fedsync_storage::SyncRunQuery;
use fedsync_sync::SyncService;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedsync-web";

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;
const DEFAULT_HEALTH_HOURS: u64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

impl AppState {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SyncLogsQuery {
    sync_type: Option<String>,
    /// Comma-separated list, e.g. `FAILED,PARTIAL`.
    status: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SyncTypeQuery {
    sync_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct HealthQuery {
    max_age_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    mode: Option<String>,
}

#[derive(Debug, Clone)]
struct DashboardRow {
    sync_type: String,
    status: String,
    mode: String,
    started_at: String,
    completed_at: String,
    processed: u64,
    errors: u64,
    healthy: bool,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    rows: Vec<DashboardRow>,
    max_age_hours: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/sync-logs", get(list_logs_handler))
        .route("/sync-logs/latest", get(latest_log_handler))
        .route("/sync-logs/recent", get(recent_logs_handler))
        .route("/sync-logs/failed", get(failed_logs_handler))
        .route("/sync-logs/health", get(health_handler))
        .route("/sync-logs/{id}", get(log_detail_handler))
        .route("/sync/{sync_type}", post(trigger_handler))
        .route("/sync-runs/{id}/cancel", post(cancel_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: SyncService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin server listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    let audit = state.service.audit();
    let health = match audit
        .health(Duration::from_secs(DEFAULT_HEALTH_HOURS * 3600))
        .await
    {
        Ok(health) => health,
        Err(err) => return server_error(err.into()),
    };
    let mut rows = Vec::with_capacity(health.len());
    for entry in health {
        let latest = match audit.latest(entry.sync_type).await {
            Ok(latest) => latest,
            Err(err) => return server_error(err.into()),
        };
        rows.push(match latest {
            Some(run) => DashboardRow {
                sync_type: run.sync_type.to_string(),
                status: run.status.to_string(),
                mode: run.mode.to_string(),
                started_at: run.started_at.to_rfc3339(),
                completed_at: run
                    .completed_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".into()),
                processed: run.records_processed,
                errors: run.error_count,
                healthy: entry.healthy,
            },
            None => DashboardRow {
                sync_type: entry.sync_type.to_string(),
                status: "never run".into(),
                mode: "-".into(),
                started_at: "-".into(),
                completed_at: "-".into(),
                processed: 0,
                errors: 0,
                healthy: false,
            },
        });
    }
    render_html(DashboardTemplate {
        rows,
        max_age_hours: DEFAULT_HEALTH_HOURS,
    })
}

async fn list_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogsQuery>,
) -> Response {
    let sync_type = match query.sync_type.as_deref().map(parse_sync_type).transpose() {
        Ok(sync_type) => sync_type,
        Err(resp) => return resp,
    };
    let statuses = match query.status.as_deref().map(parse_statuses).transpose() {
        Ok(statuses) => statuses.unwrap_or_default(),
        Err(resp) => return resp,
    };
    let run_query = SyncRunQuery {
        sync_type,
        statuses,
        since: query.since,
        until: query.until,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
    };
    match state.service.audit().list(&run_query).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn latest_log_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncTypeQuery>,
) -> Response {
    let audit = state.service.audit();
    let latest = match query.sync_type.as_deref() {
        Some(raw) => match parse_sync_type(raw) {
            Ok(sync_type) => audit.latest(sync_type).await,
            Err(resp) => return resp,
        },
        None => audit.recent(1).await.map(|mut runs| runs.pop()),
    };
    match latest {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => not_found("no sync runs recorded"),
        Err(err) => server_error(err.into()),
    }
}

async fn recent_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10).min(MAX_LIST_LIMIT);
    match state.service.audit().recent(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn failed_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    match state.service.audit().failed(Some(limit)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HealthQuery>,
) -> Response {
    let hours = query.max_age_hours.unwrap_or(DEFAULT_HEALTH_HOURS);
    let max_age = Duration::from_secs(hours.saturating_mul(3600));
    match state.service.audit().health(max_age).await {
        Ok(health) => Json(health).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn log_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.service.audit().get(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => not_found(&format!("sync run {id} not found")),
        Err(err) => server_error(err.into()),
    }
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path(sync_type): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let sync_type = match parse_sync_type(&sync_type) {
        Ok(sync_type) => sync_type,
        Err(resp) => return resp,
    };
    let mode = match query.mode.as_deref().map(str::parse::<SyncMode>).transpose() {
        Ok(mode) => mode.unwrap_or_default(),
        Err(err) => return bad_request(&err.to_string()),
    };
    Json(state.service.trigger(sync_type, mode).await).into_response()
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let cancelled = state.service.cancel(id).await;
    Json(json!({ "runId": id, "cancelled": cancelled })).into_response()
}

fn parse_sync_type(raw: &str) -> Result<SyncType, Response> {
    raw.parse().map_err(|err: fedsync_core::ParseEnumError| bad_request(&err.to_string()))
}

fn parse_statuses(raw: &str) -> Result<Vec<SyncStatus>, Response> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.parse()
                .map_err(|err: fedsync_core::ParseEnumError| bad_request(&err.to_string()))
        })
        .collect()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use fedsync_core::{ExternalRecord, OpportunityFields, SourceFields};
    use fedsync_source::MemorySource;
    use fedsync_storage::MemoryStore;
    use fedsync_sync::SyncTypeRegistry;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn opportunity(n: usize) -> ExternalRecord {
        ExternalRecord::Parsed(SourceFields::Opportunity(OpportunityFields {
            notice_id: Some(format!("W-{n}")),
            title: format!("Web notice {n}"),
            notice_type: "Presolicitation".into(),
            ..Default::default()
        }))
    }

    async fn seeded_service() -> (SyncService, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let source = MemorySource::new()
            .with_records(SyncType::Opportunities, (0..3).map(opportunity).collect());
        let service = SyncService::new(
            store.clone(),
            store,
            Arc::new(source),
            SyncTypeRegistry::defaults(),
        );
        let summary = service
            .run_now(SyncType::Opportunities, SyncMode::Full)
            .await
            .unwrap()
            .unwrap();
        (service, summary.run.id)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn dashboard_lists_every_sync_type() {
        let (service, _) = seeded_service().await;
        let (status, text) = get(app(AppState::new(service)), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Federal Sync Status"));
        assert!(text.contains("opportunities"));
        assert!(text.contains(r#"<td class="SUCCESS">SUCCESS</td>"#));
        assert!(text.contains("never run"));
    }

    #[tokio::test]
    async fn sync_logs_filter_by_type_and_status() {
        let (service, run_id) = seeded_service().await;
        let app = app(AppState::new(service));

        let (status, text) = get(
            app.clone(),
            "/sync-logs?syncType=opportunities&status=SUCCESS,PARTIAL",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let runs: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["id"], json!(run_id));

        let (_, text) = get(app.clone(), "/sync-logs?syncType=awards").await;
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!([]));

        let (status, _) = get(app, "/sync-logs?syncType=grants").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_run_lookups() {
        let (service, run_id) = seeded_service().await;
        let app = app(AppState::new(service));

        let (status, text) = get(app.clone(), &format!("/sync-logs/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap()["id"], json!(run_id));

        let (status, _) = get(app.clone(), &format!("/sync-logs/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, text) = get(app.clone(), "/sync-logs/latest?syncType=opportunities").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap()["id"], json!(run_id));

        let (status, _) = get(app, "/sync-logs/latest?syncType=awards").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_failed_views() {
        let (service, _) = seeded_service().await;
        let app = app(AppState::new(service));

        let (status, text) = get(app.clone(), "/sync-logs/health?maxAgeHours=1").await;
        assert_eq!(status, StatusCode::OK);
        let health: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(health.as_array().unwrap().len(), 3);
        let opps = health
            .as_array()
            .unwrap()
            .iter()
            .find(|h| h["syncType"] == json!("opportunities"))
            .unwrap();
        assert_eq!(opps["healthy"], json!(true));

        let (status, text) = get(app.clone(), "/sync-logs/failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!([]));

        let (status, text) = get(app, "/sync-logs/recent?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trigger_and_cancel_endpoints() {
        let (service, _) = seeded_service().await;
        let app = app(AppState::new(service));

        let (status, body) = post(app.clone(), "/sync/awards?mode=full").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], json!(true));
        assert!(body["runId"].is_string());

        let (status, _) = post(app.clone(), "/sync/grants").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(app, &format!("/sync-runs/{}/cancel", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], json!(false));
    }

    #[tokio::test]
    async fn json_endpoints_set_the_content_type() {
        let (service, _) = seeded_service().await;
        let resp = app(AppState::new(service))
            .oneshot(Request::builder().uri("/sync-logs/recent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
    }
}
