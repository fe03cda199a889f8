pub mod devices;
pub mod events;
pub mod health;
pub mod hls;
pub mod metrics;
pub mod stream;
pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Full HTTP surface of the gateway with its middleware stack.
pub fn router(state: AppState, prometheus: PrometheusHandle) -> Router {
    let body_limit = state.config.max_body_bytes;

    // Live streams and HLS media must reach viewers unbuffered.
    let compress_when = DefaultPredicate::new()
        .and(NotForContentType::const_new("multipart/"))
        .and(NotForContentType::const_new("video/"));

    Router::new()
        .route("/health", get(health::health_check))
        // Frames and classification
        .route("/upload", post(upload::upload))
        .route("/detect", post(upload::detect))
        .route("/snapshot", get(upload::snapshot))
        .route("/events", get(events::events))
        // Live streams
        .route("/video_feed", get(stream::video_feed))
        .route("/device_stream", get(stream::device_stream))
        .route("/probe_stream", get(stream::probe_stream))
        .route("/normalize_stream", get(stream::normalize_stream))
        // Device registry
        .route("/devices", get(devices::list_devices))
        .route("/devices/status", get(devices::registry_status))
        .route("/devices/normalize", post(devices::normalize_devices))
        .route("/devices/{id}/stream", get(devices::device_stream_url))
        .route("/devices/{id}/register_stream", post(devices::register_stream))
        // On-demand HLS
        .route("/hls", get(hls::start))
        .route("/hls/available", get(hls::available))
        .route("/hls/{id}/index.m3u8", get(hls::playlist))
        .route("/hls/{id}/{segment}", get(hls::segment))
        .with_state(state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new().compress_when(compress_when))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
