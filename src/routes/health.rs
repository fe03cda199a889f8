use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::QueueStats;
use crate::models::device::RegistryStatus;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: ComponentHealth<QueueStats>,
    pub registry: ComponentHealth<RegistryStatus>,
    pub transcoder: ComponentHealth<TranscoderHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth<T> {
    pub status: String,
    pub detail: T,
}

#[derive(Serialize)]
pub struct TranscoderHealth {
    pub available: bool,
    pub sessions: usize,
}

/// GET /health: component status. Unhealthy only while uploads are being shed.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = state.queue.stats();
    let queue = ComponentHealth {
        status: if stats.is_saturated() { "saturated" } else { "ok" }.to_string(),
        detail: stats,
    };

    let registry = ComponentHealth {
        status: "ok".to_string(),
        detail: state.registry.status().await,
    };

    let available = state.transcoder.is_backend_available().await;
    let transcoder = ComponentHealth {
        status: if available { "ok" } else { "unavailable" }.to_string(),
        detail: TranscoderHealth {
            available,
            sessions: state.transcoder.session_count().await,
        },
    };

    let healthy = !stats.is_saturated();
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            queue,
            registry,
            transcoder,
        },
    };

    (status_code, Json(response))
}
