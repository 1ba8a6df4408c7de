mod health;
mod metrics;
mod people_count;

use crate::server::SharedState;
use axum::{routing::get, Router};

use health::healthcheck;
use metrics::metrics_handler;
use people_count::{latest_count, count_stream};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route("/people_count", get(latest_count))
        .route("/people_count/stream", get(count_stream))
}
