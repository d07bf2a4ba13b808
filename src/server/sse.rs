//! Server-Sent Events stream of one user's lifecycle and message events.
//!
//! Each [`crate::events::Event`] is sent as an SSE event named after its
//! type (`message_received`, `connected`, ...) with the JSON event as data.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::events::Event;

use super::handlers::UserPath;
use super::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// GET /v1/{kind}/{user_id}/events
pub async fn user_events(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.router.events().subscribe_user(&path.user());
    let (rx, filter) = subscription.into_parts();
    debug!(user = ?filter, "event stream opened");

    let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(event) if filter.as_ref().map_or(true, |u| *u == event.user) => {
            Some(Ok(to_sse(&event)))
        }
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event stream lagged, events dropped");
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

fn to_sse(event: &Event) -> SseEvent {
    let name = event.kind.name();
    let sse = SseEvent::default().id(event.id.to_string()).event(name);
    match sse.json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(event = name, error = %e, "event not serializable");
            SseEvent::default().event("error").data(e.to_string())
        }
    }
}
