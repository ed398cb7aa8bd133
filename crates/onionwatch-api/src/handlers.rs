//! API Handlers
//!
//! Thin typed layer over the store and the scan orchestrator. Errors are
//! `{"detail": ...}` bodies with the matching HTTP status.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use onionwatch::monitor::RegisterError;
use onionwatch::store::{StoreError, WatchSnapshot, DEFAULT_HISTORY_PAGE};
use onionwatch::{fingerprint, Alert, AlertStatus, CompareResult, Monitor, ScanRecord, WatchService};
use std::sync::Arc;

use crate::models::*;

pub type AppState = Arc<WatchService>;

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::not_found(msg),
            StoreError::MonitorCapReached { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            StoreError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scan", post(scan))
        .route("/compare/:fingerprint", get(compare))
        .route("/history", get(history))
        .route("/history/:id", get(history_entry))
        .route("/monitors", get(monitors_list).post(monitors_create))
        .route("/monitors/all", delete(monitors_delete_all))
        .route(
            "/monitors/:id",
            get(monitor_get).delete(monitor_delete),
        )
        .route("/monitors/:id/pause", post(monitor_pause))
        .route("/monitors/:id/resume", post(monitor_resume))
        .route("/alerts", get(alerts_list))
        .route("/alerts/:id/acknowledge", post(alert_acknowledge))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn validate_url(raw: &str) -> Result<String, ApiError> {
    let parsed =
        url::Url::parse(raw.trim()).map_err(|_| ApiError::bad_request("invalid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("invalid URL"));
    }
    Ok(parsed.to_string())
}

async fn scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<ScanRecord> {
    let url = validate_url(&request.url)?;
    let record = state.scanner.scan(&url).await?;
    Ok(Json(record))
}

async fn compare(
    State(state): State<AppState>,
    Path(raw_fingerprint): Path<String>,
    Query(_query): Query<CompareQuery>,
) -> ApiResult<CompareResult> {
    // Accept both a prepared fingerprint and a raw URL form of it.
    let fp = fingerprint(&raw_fingerprint);
    Ok(Json(state.store.compare(&fp)?))
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_PAGE);
    let offset = query.offset.unwrap_or(0);
    let history = state
        .store
        .history(limit, offset)
        .iter()
        .map(ScanSummary::from)
        .collect();
    Json(HistoryResponse { history })
}

async fn history_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ScanRecord> {
    state
        .store
        .get_scan(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no scan {}", id)))
}

async fn monitors_list(State(state): State<AppState>) -> Json<MonitorsResponse> {
    Json(MonitorsResponse {
        monitors: state.store.list_monitors(),
    })
}

async fn monitors_create(
    State(state): State<AppState>,
    Json(request): Json<MonitorCreateRequest>,
) -> Result<(StatusCode, Json<Monitor>), ApiError> {
    let url = validate_url(&request.url)?;
    let monitor = state
        .scheduler
        .register(&url, request.interval, "default")
        .map_err(|e| match e {
            RegisterError::InvalidInterval(_) => ApiError::bad_request(e.to_string()),
            RegisterError::Store(e) => e.into(),
        })?;
    Ok((StatusCode::CREATED, Json(monitor)))
}

async fn monitor_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Monitor> {
    state
        .store
        .get_monitor(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no monitor {}", id)))
}

async fn monitor_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeletedResponse> {
    if state.store.delete_monitor(&id) {
        Ok(Json(DeletedResponse { deleted: true }))
    } else {
        Err(ApiError::not_found(format!("no monitor {}", id)))
    }
}

async fn monitors_delete_all(State(state): State<AppState>) -> Json<DeletedCountResponse> {
    Json(DeletedCountResponse {
        deleted: state.store.delete_all_monitors(),
    })
}

async fn monitor_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Monitor> {
    state
        .store
        .set_monitor_paused(&id, true)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no monitor {}", id)))
}

async fn monitor_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Monitor> {
    state
        .store
        .set_monitor_paused(&id, false)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no monitor {}", id)))
}

async fn alerts_list(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<AlertsResponse> {
    let status = match query.status.as_deref() {
        None => None,
        Some("new") => Some(AlertStatus::New),
        Some("acknowledged") => Some(AlertStatus::Acknowledged),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown alert status filter: {}",
                other
            )))
        }
    };
    Ok(Json(AlertsResponse {
        alerts: state.store.list_alerts(status),
    }))
}

async fn alert_acknowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Alert> {
    state
        .store
        .acknowledge_alert(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no alert {}", id)))
}

async fn stats(State(state): State<AppState>) -> Json<WatchSnapshot> {
    Json(state.store.snapshot())
}
