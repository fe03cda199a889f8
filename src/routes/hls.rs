use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::io::ErrorKind;

use crate::app_state::AppState;
use crate::error::{GatewayError, Result};
use crate::models::session::TranscodeOptions;
use crate::models::stream::{HlsStartResponse, TargetQuery};
use crate::routes::stream::target_query;
use crate::services::transcode::PLAYLIST_NAME;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// GET /hls/available
pub async fn available(State(state): State<AppState>) -> Json<Value> {
    let available = state.transcoder.is_backend_available().await;
    Json(json!({ "ok": true, "available": available }))
}

/// GET /hls: start (or join) a transcode session for a camera.
pub async fn start(
    State(state): State<AppState>,
    target: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<HlsStartResponse>> {
    let target = target_query(target)?;
    let resolved = state.proxy.resolve_for_transcode(&target).await?;

    if !state.transcoder.is_backend_available().await {
        return Err(GatewayError::TranscodeUnavailable);
    }

    let session = state
        .transcoder
        .start(&resolved.url, &TranscodeOptions::default())
        .await?;

    let playlist = format!(
        "/hls/{}/{}?ts={}",
        session.id,
        PLAYLIST_NAME,
        chrono::Utc::now().timestamp_millis()
    );
    Ok(Json(HlsStartResponse {
        ok: true,
        id: session.id,
        playlist,
    }))
}

/// GET /hls/{id}/index.m3u8
pub async fn playlist(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let session = state
        .transcoder
        .get_entry(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("no transcode session {}", id)))?;
    state.transcoder.touch(&id).await;

    match tokio::fs::read(&session.playlist).await {
        Ok(bytes) => Ok(file_response(bytes, PLAYLIST_CONTENT_TYPE)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(GatewayError::NotReady("playlist not written yet".to_string()))
        }
        Err(e) => Err(GatewayError::Internal(e.to_string())),
    }
}

/// GET /hls/{id}/{segment}
pub async fn segment(
    State(state): State<AppState>,
    Path((id, segment)): Path<(String, String)>,
) -> Result<Response> {
    if segment.contains('/') || segment.contains('\\') || segment.contains("..") {
        return Err(GatewayError::InvalidRequest(format!("bad segment name {:?}", segment)));
    }

    let session = state
        .transcoder
        .get_entry(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("no transcode session {}", id)))?;
    state.transcoder.touch(&id).await;

    match tokio::fs::read(session.dir.join(&segment)).await {
        Ok(bytes) => Ok(file_response(bytes, content_type_for(&segment))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(GatewayError::NotFound(format!("no segment {}", segment)))
        }
        Err(e) => Err(GatewayError::Internal(e.to_string())),
    }
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("ts") => SEGMENT_CONTENT_TYPE,
        Some("m3u8") => PLAYLIST_CONTENT_TYPE,
        Some("mp4") | Some("m4s") => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn file_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        bytes,
    )
        .into_response()
}
