//! Sampling loop: timer tick → frame → payload → transport, results back to
//! the caller's sink.
//!
//! While sampling, one tokio task owns the whole pipeline and reacts to three
//! inputs: timer ticks, session events and the pending-response deadline. At
//! most one frame is in flight; a tick that finds the slot occupied is
//! dropped rather than queued.

use crate::{
    encoder::FrameEncoder,
    frame::FrameSource,
    session::{
        event_channel, EventSender, InferenceResult, SessionEvent, SessionState, Ticket,
        Transport, TransportError,
    },
    telemetry::Metrics,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};

/// Receives every successful inference result, in arrival order.
pub trait ResultSink: Send + 'static {
    fn on_result(&mut self, result: InferenceResult);
}

impl<F> ResultSink for F
where
    F: FnMut(InferenceResult) + Send + 'static,
{
    fn on_result(&mut self, result: InferenceResult) {
        self(result)
    }
}

#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub interval: Duration,
    pub response_timeout: Duration,
}

impl StreamingSettings {
    /// Response timeout defaults to twice the interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            response_timeout: interval * 2,
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000))
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Streaming pipeline was lost when the sampling task failed")]
    PipelineLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Sampling,
}

struct Pipeline<T> {
    source: Box<dyn FrameSource>,
    encoder: Box<dyn FrameEncoder>,
    transport: T,
    sink: Box<dyn ResultSink>,
    next_ticket: Ticket,
}

struct Running<T> {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Pipeline<T>>,
}

pub struct StreamingController<T: Transport> {
    settings: StreamingSettings,
    metrics: Arc<Metrics>,
    pipeline: Option<Pipeline<T>>,
    running: Option<Running<T>>,
}

impl<T: Transport> StreamingController<T> {
    pub fn new(
        source: impl FrameSource,
        encoder: impl FrameEncoder,
        transport: T,
        sink: impl ResultSink,
        settings: StreamingSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            metrics,
            pipeline: Some(Pipeline {
                source: Box::new(source),
                encoder: Box::new(encoder),
                transport,
                sink: Box::new(sink),
                next_ticket: 0,
            }),
            running: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        if self.running.is_some() {
            ControllerState::Sampling
        } else {
            ControllerState::Idle
        }
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    /// Arms the timer; the first tick fires immediately. No-op while
    /// already sampling. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.running.is_some() {
            return Ok(());
        }
        let pipeline = self.pipeline.take().ok_or(ControllerError::PipelineLost)?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(
            pipeline,
            self.settings.clone(),
            self.metrics.clone(),
            shutdown_rx,
        ));

        self.running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Disarms the timer and closes the session. Once this returns no tick
    /// runs and no result reaches the sink. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        match running.handle.await {
            Ok(pipeline) => self.pipeline = Some(pipeline),
            Err(e) => tracing::error!(error = %e, "Sampling task ended abnormally"),
        }
    }
}

impl<T: Transport> Drop for StreamingController<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    ticket: Ticket,
    sent_at: Instant,
    deadline: Instant,
}

/// The single outstanding-request slot.
#[derive(Debug, Default)]
struct PendingSlot {
    last_ticket: Ticket,
    pending: Option<Pending>,
}

impl PendingSlot {
    fn starting_after(last_ticket: Ticket) -> Self {
        Self {
            last_ticket,
            pending: None,
        }
    }

    fn is_occupied(&self) -> bool {
        self.pending.is_some()
    }

    fn occupy(&mut self, now: Instant, timeout: Duration) -> Ticket {
        self.last_ticket += 1;
        self.pending = Some(Pending {
            ticket: self.last_ticket,
            sent_at: now,
            deadline: now + timeout,
        });
        self.last_ticket
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    fn clear(&mut self) -> Option<Pending> {
        self.pending.take()
    }

    /// Ticketed replies must match the pending send. Unticketed (duplex)
    /// replies answer whatever is outstanding.
    fn accepts(&self, ticket: Option<Ticket>) -> bool {
        match ticket {
            Some(ticket) => self.pending.is_some_and(|p| p.ticket == ticket),
            None => true,
        }
    }
}

struct Sampler<T> {
    pipeline: Pipeline<T>,
    slot: PendingSlot,
    settings: StreamingSettings,
    metrics: Arc<Metrics>,
    events: EventSender,
}

async fn run<T: Transport>(
    pipeline: Pipeline<T>,
    settings: StreamingSettings,
    metrics: Arc<Metrics>,
    mut shutdown: oneshot::Receiver<()>,
) -> Pipeline<T> {
    let (events, mut events_rx) = event_channel();
    let mut sampler = Sampler {
        slot: PendingSlot::starting_after(pipeline.next_ticket),
        pipeline,
        settings,
        metrics,
        events,
    };

    let mut ticker = interval(sampler.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = sampler.settings.interval.as_millis() as u64,
        response_timeout_ms = sampler.settings.response_timeout.as_millis() as u64,
        "Sampling started"
    );

    loop {
        let deadline = sampler.slot.deadline();
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(event) = events_rx.recv() => sampler.on_event(event),
            _ = wait_until(deadline) => sampler.on_timeout(),
            _ = ticker.tick() => sampler.on_tick().await,
        }
    }

    sampler.pipeline.transport.close().await;
    sampler.pipeline.next_ticket = sampler.slot.last_ticket;
    tracing::info!("Sampling stopped");

    sampler.pipeline
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<T: Transport> Sampler<T> {
    async fn on_tick(&mut self) {
        if self.slot.is_occupied() {
            tracing::debug!("Previous frame still in flight, skipping tick");
            self.metrics.record_skipped_tick("backpressure");
            return;
        }

        let transport = &mut self.pipeline.transport;
        if transport.state() != SessionState::Open {
            if let Err(e) = transport.connect(self.events.clone()).await {
                tracing::warn!(error = %e, "Could not open session, skipping tick");
                self.metrics.record_transport_error(e.kind());
                self.metrics.record_skipped_tick("disconnected");
                return;
            }
        }

        let Some(frame) = self.pipeline.source.current_frame() else {
            tracing::debug!("Frame source not ready, skipping tick");
            self.metrics.record_skipped_tick("source_unavailable");
            return;
        };

        let payload = match self.pipeline.encoder.encode(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode frame, skipping tick");
                self.metrics.record_skipped_tick("encode_failed");
                return;
            }
        };

        let ticket = self
            .slot
            .occupy(Instant::now(), self.settings.response_timeout);
        match self.pipeline.transport.send(ticket, payload).await {
            Ok(()) => {
                tracing::debug!(ticket, frame_ts = frame.timestamp_ms, "Frame sent");
                self.metrics.record_frame_sent();
            }
            Err(e) => {
                self.slot.clear();
                tracing::warn!(ticket, error = %e, "Failed to send frame");
                self.metrics.record_transport_error(e.kind());
            }
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Response { ticket, outcome } => {
                if !self.slot.accepts(ticket) {
                    tracing::debug!(?ticket, "Discarding stale response");
                    return;
                }

                let round_trip_ms = self
                    .slot
                    .clear()
                    .map(|p| p.sent_at.elapsed().as_millis() as u64);

                match outcome {
                    Ok(result) => {
                        tracing::info!(
                            people_count = result.people_count,
                            label = ?result.label,
                            round_trip_ms,
                            "People detected"
                        );
                        self.metrics
                            .record_result(result.people_count, round_trip_ms);
                        self.pipeline.sink.on_result(result);
                    }
                    Err(e) => {
                        tracing::warn!(?ticket, error = %e, "Frame failed");
                        self.metrics.record_transport_error(e.kind());
                    }
                }
            }
            SessionEvent::ConnectionLost(e) => {
                tracing::warn!(error = %e, "Session lost, reconnecting on next tick");
                self.slot.clear();
                self.metrics.record_transport_error(e.kind());
            }
        }
    }

    fn on_timeout(&mut self) {
        if let Some(pending) = self.slot.clear() {
            let error = TransportError::ResponseTimeout(self.settings.response_timeout);
            tracing::warn!(ticket = pending.ticket, error = %error, "Clearing stuck frame");
            self.metrics.record_transport_error(error.kind());
        }
    }
}
