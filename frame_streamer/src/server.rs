use crate::{config::ServerConfig, routes::api_routes, session::InferenceResult, telemetry::Metrics};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, watch},
    task::JoinHandle,
};

/// Latest result as published to status clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountUpdate {
    pub people_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub received_at_ms: u64,
}

impl CountUpdate {
    pub fn new(result: InferenceResult, received_at_ms: u64) -> Self {
        Self {
            people_count: result.people_count,
            label: result.label,
            received_at_ms,
        }
    }
}

#[derive(Clone)]
pub struct SharedState {
    pub metrics: Arc<Metrics>,
    pub results: watch::Receiver<Option<CountUpdate>>,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        metrics: Arc<Metrics>,
        results: watch::Receiver<Option<CountUpdate>>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState { metrics, results };

        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Status server listening on {}", addr);
        }

        tokio::spawn(async move {
            axum::serve(self.listener, self.router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        })
    }
}
