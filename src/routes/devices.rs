use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use garde::Validate;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::app_state::AppState;
use crate::error::{GatewayError, Result};
use crate::models::device::DeviceEntry;
use crate::models::stream::{DeviceStreamResponse, RegisterStreamRequest, RegisterStreamResponse};

/// POST /devices/{id}/register_stream
pub async fn register_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<RegisterStreamRequest>, JsonRejection>,
) -> Result<Json<RegisterStreamResponse>> {
    let Json(request) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    request
        .validate()
        .map_err(|report| GatewayError::InvalidUrl(report.to_string()))?;

    if !state.registry.set(&id, &request.url).await {
        return Err(GatewayError::InvalidRequest(format!(
            "cannot register stream for device {:?}",
            id
        )));
    }
    let url = state.registry.get(&id).await.unwrap_or(request.url);
    tracing::info!(device_id = %id, url = %url, "Registered stream");

    Ok(Json(RegisterStreamResponse { ok: true, id, url }))
}

/// GET /devices/{id}/stream
pub async fn device_stream_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceStreamResponse>> {
    match state.registry.get(&id).await {
        Some(url) => Ok(Json(DeviceStreamResponse { id, url })),
        None => Err(GatewayError::NotFound(format!("no stream registered for {}", id))),
    }
}

/// GET /devices
pub async fn list_devices(State(state): State<AppState>) -> Json<BTreeMap<String, DeviceEntry>> {
    Json(state.registry.list().await)
}

/// GET /devices/status
pub async fn registry_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.registry.status().await;
    Json(json!({ "ok": true, "status": status }))
}

/// POST /devices/normalize: rewrite stored entries into canonical form.
pub async fn normalize_devices(State(state): State<AppState>) -> Json<Value> {
    let changed = state.registry.normalize_all().await;
    tracing::info!(changed, "Normalized device registry");
    Json(json!({ "ok": true, "result": { "changed": changed } }))
}
