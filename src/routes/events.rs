use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

use crate::app_state::AppState;

/// GET /events: frames, detections and job progress as Server-Sent Events.
///
/// Slow viewers skip whatever they lagged behind on.
pub async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hub = BroadcastStream::new(state.hub.subscribe()).filter_map(|msg| async move {
        let msg = msg.ok()?;
        Event::default().event(msg.event_name()).json_data(&msg).ok()
    });
    let jobs = BroadcastStream::new(state.queue.subscribe()).filter_map(|event| async move {
        Event::default().event("job").json_data(&event.ok()?).ok()
    });

    Sse::new(stream::select(hub, jobs).map(Ok)).keep_alive(KeepAlive::default())
}
