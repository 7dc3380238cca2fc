//! HTTP handlers for the device-facing and owner-facing routes.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, Level};

use hisp_core::{DeviceId, Frame};
use hisp_store::activity::{ActivityKind, ActivityRepo, ActivityRow};
use hisp_store::devices::{DeviceRepo, DeviceRow};
use hisp_store::StoreError;
use hisp_telemetry::{LogQuery, LogRecord};

use crate::channel::{DeliveryChannel, SseChannel};
use crate::connection::ConnectionState;
use crate::dispatcher::DispatchOutcome;
use crate::error::ApiError;
use crate::server::AppState;

const DEFAULT_ACTIVITY_LIMIT: u32 = 50;

/// Run a blocking repository call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f)
        .await
        .map_err(StoreError::from)??)
}

async fn ensure_registered(state: &AppState, device_id: DeviceId) -> Result<(), ApiError> {
    let devices = DeviceRepo::new(state.db.clone());
    if blocking(move || devices.exists(device_id)).await? {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("device {device_id}")))
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "connections": state.registry.active_count().await,
    }))
}

/// Open the device's event stream. The first frame is the greeting; after
/// that the device receives dispatched events and periodic keepalives.
pub async fn device_events(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<Response, ApiError> {
    ensure_registered(&state, device_id).await?;

    let (channel, receiver) = SseChannel::open(state.send_queue);
    channel.write(&Frame::keepalive());
    let connection_id = channel.id().clone();
    let body = receiver
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(Bytes::from(frame.into_string())));

    let outcome = state.registry.acquire(device_id, channel).await;
    info!(device_id = %device_id, connection_id = %connection_id, ?outcome, "event stream opened");

    Ok((
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(body),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub outcome: DispatchOutcome,
}

pub async fn request_action(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<Json<ActionResponse>, ApiError> {
    ensure_registered(&state, device_id).await?;
    let outcome = state.dispatcher.request_action(device_id).await;
    debug!(device_id = %device_id, ?outcome, "action requested");
    Ok(Json(ActionResponse { outcome }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReport {
    pub value: f64,
    #[serde(default)]
    pub sensor_str: String,
}

pub async fn push_sensor(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Json(report): Json<SensorReport>,
) -> Result<StatusCode, ApiError> {
    if !report.value.is_finite() {
        return Err(ApiError::BadRequest("sensor value must be finite".into()));
    }
    let devices = DeviceRepo::new(state.db.clone());
    let activity = ActivityRepo::new(state.db.clone());
    blocking(move || {
        devices.update_sensor(device_id, report.value, &report.sensor_str)?;
        let data = json!({ "value": report.value, "sensorStr": report.sensor_str }).to_string();
        activity.append(device_id, ActivityKind::Sensor, Some(&data))?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReport {
    pub log_data: String,
}

pub async fn push_log(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Json(report): Json<LogReport>,
) -> Result<StatusCode, ApiError> {
    ensure_registered(&state, device_id).await?;
    let activity = ActivityRepo::new(state.db.clone());
    blocking(move || activity.append(device_id, ActivityKind::Log, Some(&report.log_data))).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ActivityParams {
    pub limit: Option<u32>,
}

pub async fn device_activity(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Vec<ActivityRow>>, ApiError> {
    ensure_registered(&state, device_id).await?;
    let activity = ActivityRepo::new(state.db.clone());
    let limit = params.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Ok(Json(blocking(move || activity.recent(device_id, limit)).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(flatten)]
    pub device: DeviceRow,
    pub connection: Option<ConnectionState>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl DeviceInfo {
    async fn load(state: &AppState, device: DeviceRow) -> Self {
        let snapshot = state.registry.snapshot(device.id).await;
        Self {
            connection: snapshot.as_ref().map(|s| s.state),
            connected_since: snapshot.map(|s| s.opened_at),
            device,
        }
    }
}

pub async fn device_info(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
) -> Result<Json<DeviceInfo>, ApiError> {
    let devices = DeviceRepo::new(state.db.clone());
    let device = blocking(move || devices.get(device_id)).await?;
    Ok(Json(DeviceInfo::load(&state, device).await))
}

/// One device as seen by its owner. Devices owned by someone else are 404.
pub async fn owned_device(
    State(state): State<AppState>,
    Path((owner_id, device_id)): Path<(u64, DeviceId)>,
) -> Result<Json<DeviceInfo>, ApiError> {
    let devices = DeviceRepo::new(state.db.clone());
    let device = blocking(move || devices.get_owned(device_id, owner_id)).await?;
    Ok(Json(DeviceInfo::load(&state, device).await))
}

pub async fn owner_devices(
    State(state): State<AppState>,
    Path(owner_id): Path<u64>,
) -> Result<Json<Vec<DeviceRow>>, ApiError> {
    let devices = DeviceRepo::new(state.db.clone());
    Ok(Json(blocking(move || devices.list_for_owner(owner_id)).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub id: DeviceId,
    pub owner_id: u64,
    pub name: String,
}

pub async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterDevice>,
) -> Result<(StatusCode, Json<DeviceRow>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("device name is required".into()));
    }
    let devices = DeviceRepo::new(state.db.clone());
    let row = blocking(move || devices.register(request.id, request.owner_id, request.name.trim())).await?;
    info!(device_id = %row.id, owner_id = row.owner_id, "device registered");
    Ok((StatusCode::CREATED, Json(row)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogParams {
    /// Least severe level to return, e.g. `warn`.
    pub level: Option<String>,
    pub target: Option<String>,
    pub device_id: Option<u64>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub async fn query_logs(
    State(state): State<AppState>,
    Query(params): Query<LogParams>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let Some(sink) = state.log_sink.clone() else {
        return Err(ApiError::Unavailable("log persistence is disabled".into()));
    };
    let min_level = params
        .level
        .map(|level| level.parse::<Level>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let query = LogQuery {
        min_level,
        target: params.target,
        device_id: params.device_id,
        since: params.since,
        limit: params.limit,
    };
    let records = tokio::task::spawn_blocking(move || sink.query(&query))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(records))
}
