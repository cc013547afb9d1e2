//! Handlers for users, devices and estimates.
//!
//! Handlers stay thin: parse input, call [`EnergyService`], shape JSON.
//! Device, search and mail failures are absorbed below this layer, so the
//! only errors seen here are [`AppError`]s about the request itself or
//! storage.
//!
//! [`EnergyService`]: crate::services::EnergyService

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::headers::{cache_control, json_with_etag};
use super::SharedState;
use crate::error::AppError;
use crate::models::{Dashboard, DeviceDetail, DeviceSnapshot};
use crate::services::energy::{AddedDevice, Registration};
use crate::services::PowerAction;

/// Client-side caching of estimates that resolved to a figure.
const ESTIMATE_MAX_AGE: u64 = 300;
const ESTIMATE_SWR: u64 = 60;

// ---- Request shapes ----

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    pub email: Option<String>,
    pub receipt_number: String,
}

#[derive(Debug, Deserialize)]
pub struct AddDeviceRequest {
    pub name: String,
    pub ip_address: String,
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct EstimateQuery {
    pub name: Option<String>,
}

// ---- Handlers ----

/// `POST /users`: 201 for a new user, 200 for a returning one.
pub async fn register_user(
    State(state): State<SharedState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Registration>), AppError> {
    let registration = state
        .service
        .register_user(
            &body.username,
            &body.full_name,
            body.email.as_deref(),
            &body.receipt_number,
        )
        .await?;

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration)))
}

pub async fn energy_data(
    State(state): State<SharedState>,
    Path(receipt): Path<String>,
) -> Result<Json<Vec<DeviceSnapshot>>, AppError> {
    Ok(Json(state.service.energy_data(&receipt).await?))
}

pub async fn dashboard(
    State(state): State<SharedState>,
    Path(receipt): Path<String>,
) -> Result<Json<Dashboard>, AppError> {
    Ok(Json(state.service.dashboard(&receipt).await?))
}

pub async fn device_detail(
    State(state): State<SharedState>,
    Path((receipt, device_id)): Path<(String, i64)>,
) -> Result<Json<DeviceDetail>, AppError> {
    Ok(Json(state.service.device_detail(&receipt, device_id).await?))
}

pub async fn add_device(
    State(state): State<SharedState>,
    Path(receipt): Path<String>,
    Json(body): Json<AddDeviceRequest>,
) -> Result<(StatusCode, Json<AddedDevice>), AppError> {
    let added = state
        .service
        .add_device(&receipt, &body.name, &body.ip_address)
        .await?;
    Ok((StatusCode::CREATED, Json(added)))
}

pub async fn delete_device(
    State(state): State<SharedState>,
    Path((receipt, device_id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    state.service.delete_device(&receipt, device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_power(
    State(state): State<SharedState>,
    Path((receipt, device_id)): Path<(String, i64)>,
    Json(body): Json<PowerRequest>,
) -> Result<Json<Value>, AppError> {
    let action = PowerAction::parse(&body.action).ok_or_else(|| {
        AppError::Validation(format!(
            "Invalid action '{}'. Must be one of: on, off",
            body.action
        ))
    })?;

    let message = state
        .service
        .set_device_power(&receipt, device_id, action)
        .await?;
    Ok(Json(json!({ "message": message })))
}

pub async fn live_consumption(
    State(state): State<SharedState>,
    Path(device_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let kwh = state.service.live_consumption(device_id).await?;
    Ok(Json(json!({ "consumo_actual": kwh })))
}

/// `GET /estimates?name=`. Resolved figures are cacheable by clients;
/// "not found" is not, since a late external answer may still arrive.
pub async fn estimate(
    State(state): State<SharedState>,
    Query(params): Query<EstimateQuery>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let name = params
        .name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Query parameter 'name' is required".into()))?;

    let estimate = state.service.estimates().resolve(&name).await;
    let caching = if estimate.daily_kwh.is_some() {
        cache_control(ESTIMATE_MAX_AGE, ESTIMATE_SWR)
    } else {
        HeaderValue::from_static("no-store")
    };

    let body = serde_json::to_vec(&estimate).map_err(|err| AppError::Parse(err.to_string()))?;
    Ok(json_with_etag(body, &request_headers, caching))
}
