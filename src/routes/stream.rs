use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, RawQuery, State};
use axum::response::Response;
use axum::Json;

use crate::app_state::AppState;
use crate::error::{GatewayError, Result};
use crate::models::stream::{NormalizeStreamResponse, ProbeResponse, TargetQuery};

/// Unwrap target selectors, reporting a malformed query string as a
/// structured `invalid_request`.
pub(crate) fn target_query(
    query: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<TargetQuery> {
    query
        .map(|Query(target)| target)
        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))
}

/// GET /video_feed: the classifier host's annotated feed.
pub async fn video_feed(State(state): State<AppState>, RawQuery(query): RawQuery) -> Result<Response> {
    let url = state.config.video_feed_url();
    Ok(state.proxy.forward_raw(&url, query.as_deref()).await?)
}

/// GET /device_stream: live stream of a camera picked by url, device or address.
pub async fn device_stream(
    State(state): State<AppState>,
    target: std::result::Result<Query<TargetQuery>, QueryRejection>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let target = target_query(target)?;
    let resolved = state.proxy.resolve(&target).await?;
    Ok(state.proxy.forward(&resolved, query.as_deref()).await?)
}

/// GET /probe_stream
pub async fn probe_stream(
    State(state): State<AppState>,
    target: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<ProbeResponse>> {
    let target = target_query(target)?;
    let resolved = state.proxy.resolve_direct(&target)?;
    Ok(Json(state.proxy.probe(&resolved).await?))
}

/// GET /normalize_stream: resolved target without contacting it.
pub async fn normalize_stream(
    State(state): State<AppState>,
    target: std::result::Result<Query<TargetQuery>, QueryRejection>,
) -> Result<Json<NormalizeStreamResponse>> {
    let target = target_query(target)?;
    let resolved = state.proxy.resolve_direct(&target)?;
    Ok(Json(NormalizeStreamResponse {
        ok: true,
        target: resolved.url,
    }))
}
