use crate::errors::Error;
use crate::model::{
    BuildingSummary, ChartPoint, LogicalOccupancy, ResetRecord, TelemetrySample, TrendPoint,
};
use crate::registry::SensorStatus;
use crate::service::{BuildingResetReport, CounterService, DeviceResets};
use crate::trend::Bucket;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    service: Arc<CounterService>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    bucket: Option<String>,
}

impl RangeQuery {
    fn bucket(&self) -> Result<Bucket, Error> {
        self.bucket.as_deref().map_or(Ok(Bucket::Hour), str::parse)
    }
}

#[derive(Debug, Deserialize)]
pub struct SamplesQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    data: Vec<TelemetrySample>,
    /// Samples in the whole range, which may exceed `limit`.
    total: u64,
    limit: usize,
}

#[derive(Debug, Serialize)]
pub struct TrendResponse<T> {
    scope: String,
    bucket: Bucket,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    points: Vec<T>,
}

pub fn create_router(service: Arc<CounterService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id/samples", get(device_samples))
        .route("/api/v1/devices/:device_id/trend", get(device_trend))
        .route("/api/v1/devices/:device_id/chart", get(device_chart))
        .route("/api/v1/devices/:device_id/resets", get(device_resets))
        .route("/api/v1/devices/:device_id/reset", post(reset_device))
        .route("/api/v1/locations", get(list_locations))
        .route("/api/v1/locations/:location/trend", get(location_trend))
        .route("/api/v1/occupancy", get(latest_devices))
        .route("/api/v1/buildings/summary", get(building_summaries))
        .route("/api/v1/buildings/:building/devices", get(building_devices))
        .route("/api/v1/buildings/:building/reset", post(reset_building))
        .route("/api/v1/sensors/status", get(sensor_status))
        .with_state(state)
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.service.list_devices().await?))
}

async fn list_locations(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.service.list_locations().await?))
}

async fn latest_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<LogicalOccupancy>>, AppError> {
    Ok(Json(state.service.latest_devices(None).await?))
}

async fn building_devices(
    State(state): State<AppState>,
    Path(building): Path<String>,
) -> Result<Json<Vec<LogicalOccupancy>>, AppError> {
    Ok(Json(state.service.latest_devices(Some(&building)).await?))
}

async fn building_summaries(
    State(state): State<AppState>,
) -> Result<Json<Vec<BuildingSummary>>, AppError> {
    Ok(Json(state.service.building_summaries().await?))
}

async fn device_samples(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<SamplesQuery>,
) -> Result<Json<SamplesResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let page = state
        .service
        .device_samples(&device_id, params.from, params.to, limit)
        .await?;
    Ok(Json(SamplesResponse {
        data: page.samples,
        total: page.total,
        limit,
    }))
}

async fn device_trend(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<TrendResponse<TrendPoint>>, AppError> {
    let bucket = params.bucket()?;
    let points = state
        .service
        .device_trend(&device_id, params.from, params.to, bucket)
        .await?;
    Ok(Json(TrendResponse {
        scope: device_id,
        bucket,
        from: params.from,
        to: params.to,
        points,
    }))
}

async fn location_trend(
    State(state): State<AppState>,
    Path(location): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<TrendResponse<TrendPoint>>, AppError> {
    let bucket = params.bucket()?;
    let points = state
        .service
        .location_trend(&location, params.from, params.to, bucket)
        .await?;
    Ok(Json(TrendResponse {
        scope: location,
        bucket,
        from: params.from,
        to: params.to,
        points,
    }))
}

async fn device_chart(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<TrendResponse<ChartPoint>>, AppError> {
    let bucket = params.bucket()?;
    let points = state
        .service
        .device_chart(&device_id, params.from, params.to, bucket)
        .await?;
    Ok(Json(TrendResponse {
        scope: device_id,
        bucket,
        from: params.from,
        to: params.to,
        points,
    }))
}

async fn device_resets(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<DeviceResets>, AppError> {
    Ok(Json(
        state
            .service
            .device_resets(&device_id, params.from, params.to)
            .await?,
    ))
}

async fn reset_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<ResetRecord>, AppError> {
    Ok(Json(state.service.reset_device(&device_id).await?))
}

async fn reset_building(
    State(state): State<AppState>,
    Path(building): Path<String>,
) -> Result<Json<BuildingResetReport>, AppError> {
    Ok(Json(state.service.reset_building(&building).await?))
}

async fn sensor_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<SensorStatus>>, AppError> {
    Ok(Json(state.service.sensor_status_seeded().await?))
}

struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::Validation(_)) | Some(Error::InvalidBucket(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
            (status, format!("Internal server error: {}", self.0)).into_response()
        } else {
            warn!("API request rejected: {}", self.0);
            (status, self.0.to_string()).into_response()
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
