use crate::server::{CountUpdate, SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::WatchStream;
use tracing::instrument;

#[instrument(skip(state))]
pub async fn latest_count(State(state): State<SharedState>) -> Response {
    let latest = state.results.borrow().clone();
    match latest {
        Some(update) => Json(update).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Pushes every new count as a server-sent event.
#[instrument(skip(state))]
pub async fn count_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.results.clone()).filter_map(|update| async move {
        let update: CountUpdate = update?;
        match Event::default().json_data(&update) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize count update");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
