use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
    last_result_ms: Option<u64>,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    let last_result_ms = state.results.borrow().as_ref().map(|r| r.received_at_ms);
    Json(Status {
        status: "Available",
        last_result_ms,
    })
}
