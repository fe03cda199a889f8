use axum::extract::{ConnectInfo, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use std::net::SocketAddr;

use crate::app_state::AppState;
use crate::error::{GatewayError, Result};
use crate::models::device::UploadOrigin;
use crate::models::job::JobOptions;
use crate::models::stream::UploadResponse;

/// Multipart field carrying the frame.
const IMAGE_FIELD: &str = "image";

/// A frame extracted from a multipart field, a JSON base64 document or a raw body.
pub struct FramePayload(pub Bytes);

#[derive(Deserialize)]
struct Base64Frame {
    image: String,
}

impl<S> FromRequest<S> for FramePayload
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let frame = if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
            let mut found = None;
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?
            {
                if field.name() == Some(IMAGE_FIELD) {
                    let data = field
                        .bytes()
                        .await
                        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
                    found = Some(data);
                    break;
                }
            }
            found
        } else if content_type.starts_with("application/json") {
            let Json(body) = Json::<Base64Frame>::from_request(req, state)
                .await
                .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(body.image.trim())
                .map_err(|e| GatewayError::InvalidRequest(format!("image is not base64: {}", e)))?;
            Some(Bytes::from(decoded))
        } else {
            Some(
                Bytes::from_request(req, state)
                    .await
                    .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?,
            )
        };

        match frame {
            Some(bytes) if !bytes.is_empty() => Ok(FramePayload(bytes)),
            _ => Err(GatewayError::NoImageProvided),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
}

fn upload_origin(headers: &HeaderMap, peer: SocketAddr) -> UploadOrigin {
    UploadOrigin {
        source_ip: Some(peer.ip().to_string()),
        device_id: header_value(headers, &["x-device-id"]).map(str::to_string),
        stream_url: header_value(headers, &["x-stream-url", "x-forwarded-stream-url"])
            .map(str::to_string),
        signal: header_value(headers, &["x-rssi", "x-device-rssi"])
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite()),
    }
}

/// Public viewer link for a device, when the gateway knows its public address.
fn public_stream_url(base: Option<String>, device_id: Option<&str>) -> Option<String> {
    let base = base?;
    let device_id = device_id?;
    reqwest::Url::parse_with_params(
        &format!("{}/device_stream", base),
        &[("device_id", device_id)],
    )
    .ok()
    .map(String::from)
}

/// POST /upload: accept a frame from a camera and queue it for classification.
pub async fn upload(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    FramePayload(frame): FramePayload,
) -> Result<Json<UploadResponse>> {
    let origin = upload_origin(&headers, peer);
    tracing::info!(
        source_ip = %peer.ip(),
        device_id = ?origin.device_id,
        bytes = frame.len(),
        "Frame uploaded"
    );

    state.registry.record_upload(&origin).await;
    state
        .hub
        .publish_frame(frame.clone(), origin.device_id.as_deref())
        .await;

    let stats = state.queue.stats();
    if stats.is_saturated() {
        metrics::counter!("detect_jobs_rejected").increment(1);
        tracing::warn!(job_queued = stats.queued, max_queue = stats.max_queue, "Detect queue saturated, shedding upload");
        return Err(GatewayError::QueueFull {
            max_queue: stats.max_queue,
        });
    }

    let job = state.queue.enqueue(frame, JobOptions::default())?;
    let job_id = job.id();
    let hub = state.hub.clone();
    tokio::spawn(async move {
        match job.await {
            Ok(result) => hub.publish_detections(result),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Detect job failed"),
        }
    });

    Ok(Json(UploadResponse {
        ok: true,
        queued: true,
        job_id,
        public_stream_url: public_stream_url(
            state.config.public_base_url(),
            origin.device_id.as_deref(),
        ),
    }))
}

/// POST /detect: classify a frame synchronously, bypassing the queue.
pub async fn detect(
    State(state): State<AppState>,
    FramePayload(frame): FramePayload,
) -> Result<Json<serde_json::Value>> {
    let result = state
        .classifier
        .classify(frame, state.config.classifier_timeout())
        .await?;
    state.hub.publish_detections(result.clone());
    Ok(Json(result))
}

/// GET /snapshot: latest uploaded frame, downscaled.
pub async fn snapshot(State(state): State<AppState>) -> Result<Response> {
    let snapshot = state
        .hub
        .latest()
        .ok_or_else(|| GatewayError::NotFound("no snapshot yet".to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(snapshot.content_type)),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
        ],
        snapshot.bytes,
    )
        .into_response())
}
