//! HTTP request handlers.

use super::AppState;
use crate::db::{AlertFilter, DeviceRecord};
use crate::error::MonitorError;
use crate::monitor::{MonitorEvent, TimeRange};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

/// Engine error rendered as a JSON body with the matching status code.
#[derive(Debug)]
pub struct ApiError(MonitorError);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            MonitorError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
            MonitorError::AlreadyResolved(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody { error: self.0.to_string(), status: status.as_u16() };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Inventory sync
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

pub async fn handle_upsert_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Json<DeviceRecord>> {
    let record = DeviceRecord {
        device_id: id,
        name: req.name,
        ip_address: req.ip_address,
        hostname: req.hostname,
    };
    state.service.upsert_device(&record)?;
    Ok(Json(record))
}

pub async fn handle_delete_device(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.service.remove_device(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Monitoring control
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMonitoringRequest {
    #[serde(default)]
    pub interval_seconds: Option<i64>,
}

pub async fn handle_start_monitoring(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<StartMonitoringRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let target = state.service.start_monitoring(id, req.interval_seconds).await?;
    Ok(Json(target))
}

pub async fn handle_stop_monitoring(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.service.stop_monitoring(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_start_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.start_all().await?))
}

pub async fn handle_stop_all(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.stop_all().await)
}

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_targets())
}

// ============================================================================
// Status and statistics
// ============================================================================

pub async fn handle_get_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.device_snapshot(id).await?))
}

pub async fn handle_get_history(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.status_history(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatisticsQuery {
    pub range: Option<String>,
    pub minutes: Option<i64>,
    pub hours: Option<i64>,
    pub days: Option<i64>,
}

impl StatisticsQuery {
    /// Resolve to a range. Exactly one selector may be given; none means the last hour.
    fn time_range(&self) -> Result<TimeRange, MonitorError> {
        let given = [self.range.is_some(), self.minutes.is_some(), self.hours.is_some(), self.days.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if given > 1 {
            return Err(MonitorError::InvalidTarget(
                "only one of range, minutes, hours or days may be given".to_string(),
            ));
        }

        match (&self.range, self.minutes, self.hours, self.days) {
            (Some(range), _, _, _) => range.parse(),
            (_, Some(n), _, _) => TimeRange::minutes(n),
            (_, _, Some(n), _) => TimeRange::hours(n),
            (_, _, _, Some(n)) => TimeRange::days(n),
            _ => Ok(TimeRange::LastHour),
        }
    }
}

pub async fn handle_get_statistics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StatisticsQuery>,
) -> ApiResult<impl IntoResponse> {
    let range = query.time_range()?;
    Ok(Json(state.service.statistics(id, range).await?))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default = "default_results_limit")]
    pub limit: i64,
}

fn default_results_limit() -> i64 {
    100
}

pub async fn handle_get_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.recent_results(id, query.limit).await?))
}

// ============================================================================
// Alerts
// ============================================================================

pub async fn handle_list_alerts(
    State(state): State<AppState>,
    Query(filter): Query<AlertFilter>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_alerts(&filter)?))
}

pub async fn handle_alert_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.alert_statistics()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomAlertRequest {
    pub device_id: Uuid,
    pub message: String,
}

pub async fn handle_create_alert(
    State(state): State<AppState>,
    Json(req): Json<CustomAlertRequest>,
) -> ApiResult<impl IntoResponse> {
    let alert = state.service.create_custom_alert(req.device_id, &req.message)?;
    Ok((StatusCode::CREATED, Json(alert)))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub actor: String,
}

pub async fn handle_acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AcknowledgeRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.actor.trim().is_empty() {
        return Err(MonitorError::InvalidTarget("actor must not be empty".to_string()).into());
    }
    Ok(Json(state.service.acknowledge_alert(id, req.actor.trim())?))
}

pub async fn handle_resolve_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.resolve_alert(id)?))
}

pub async fn handle_delete_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.service.delete_alert(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Push feed and health
// ============================================================================

/// Server-sent events for probe results, status changes and alert updates.
/// Lagging clients skip the events they missed.
pub async fn handle_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.service.subscribe()).filter_map(|item| {
        let event: MonitorEvent = item.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.kind()).data(data)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    targets: usize,
    monitored: usize,
    armed: usize,
    storage: crate::db::StorageStats,
}

pub async fn handle_health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let targets = state.service.list_targets();
    let storage = state.service.store().get_storage_stats().map_err(MonitorError::from)?;
    Ok(Json(HealthResponse {
        status: "ok",
        monitored: targets.iter().filter(|t| t.monitored).count(),
        targets: targets.len(),
        armed: state.service.armed_count().await,
        storage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let id = Uuid::new_v4();
        assert_eq!(ApiError::from(MonitorError::InvalidTarget("x".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(MonitorError::device_not_found(id)).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(MonitorError::AlreadyResolved(id)).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(MonitorError::PipelineClosed(id)).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_statistics_query_selectors() {
        let query = StatisticsQuery::default();
        assert_eq!(query.time_range().unwrap(), TimeRange::LastHour);

        let query = StatisticsQuery { range: Some("last_7d".into()), ..Default::default() };
        assert_eq!(query.time_range().unwrap(), TimeRange::Last7Days);

        let query = StatisticsQuery { hours: Some(6), ..Default::default() };
        assert_eq!(query.time_range().unwrap().duration(), chrono::Duration::hours(6));

        let query = StatisticsQuery { minutes: Some(0), ..Default::default() };
        assert!(matches!(query.time_range(), Err(MonitorError::InvalidTarget(_))));

        let query = StatisticsQuery { range: Some("last_hour".into()), days: Some(1), ..Default::default() };
        assert!(query.time_range().is_err());
    }
}
