use crate::config::{Config, SourceConfig, TransportMode};
use crate::controller::StreamingController;
use crate::encoder::JpegDataUrlEncoder;
use crate::frame::{now_ms, FrameSource, StillImageSource, SyntheticSource};
use crate::server::{CountUpdate, HttpServer};
use crate::session::{HttpSession, InferenceResult, Transport, WebSocketSession};
use crate::telemetry::Metrics;

use std::sync::Arc;
use tokio::{
    signal,
    sync::{broadcast, watch},
};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let (results_tx, results_rx) = watch::channel(None);

    let source = match build_source(&config.source) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("Failed to initialize frame source: {:?}", e);
            return Err(e);
        }
    };

    let encoder = JpegDataUrlEncoder::new(
        config.encoder.fallback_resolution,
        config.encoder.target_resolution,
        config.encoder.jpeg_quality,
    );

    let transport = build_transport(&config)?;

    let sink = move |result: InferenceResult| {
        results_tx.send_replace(Some(CountUpdate::new(result, now_ms())));
    };

    let mut controller = StreamingController::new(
        source,
        encoder,
        transport,
        sink,
        config.streaming.settings(),
        metrics.clone(),
    );

    let server = HttpServer::new(metrics, results_rx, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe());

    controller.start()?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    controller.stop().await;
    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Status server failed: {:?}", e),
        Err(e) => tracing::error!("Status server task panicked: {:?}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

fn build_source(config: &SourceConfig) -> anyhow::Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match config {
        SourceConfig::Synthetic { resolution } => {
            Box::new(SyntheticSource::new(resolution.width, resolution.height)?)
        }
        SourceConfig::StillImage { path } => Box::new(StillImageSource::open(path)?),
        #[cfg(feature = "camera")]
        SourceConfig::Camera { device_index } => {
            Box::new(crate::camera::Camera::open(*device_index)?)
        }
        #[cfg(not(feature = "camera"))]
        SourceConfig::Camera { .. } => {
            anyhow::bail!("camera source requires building with the `camera` feature")
        }
    };
    Ok(source)
}

fn build_transport(config: &Config) -> anyhow::Result<Box<dyn Transport>> {
    let endpoint = config.backend.get_endpoint();
    let connect_timeout = config.streaming.get_connect_timeout();

    tracing::info!(endpoint = %endpoint, mode = ?config.backend.mode, "Using inference backend");
    let transport: Box<dyn Transport> = match config.backend.mode {
        TransportMode::Duplex => Box::new(WebSocketSession::new(endpoint, connect_timeout)),
        TransportMode::RequestResponse => Box::new(HttpSession::new(
            endpoint,
            connect_timeout,
            config.streaming.get_response_timeout(),
        )?),
    };
    Ok(transport)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
