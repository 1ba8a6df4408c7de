//! One logical connection to the inference backend.
//!
//! Both transport shapes implement [`Transport`]; outcomes never come back
//! from `send` itself but arrive later as [`SessionEvent`]s on the channel
//! handed to `connect`.

mod duplex;
mod http;

pub use duplex::WebSocketSession;
pub use http::HttpSession;

use crate::encoder::Payload;
use async_trait::async_trait;
use frame_proto::Analysis;
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the per-run event channel.
pub const EVENT_BUFFER: usize = 16;

/// Identifies one send so its reply can be matched against the pending slot.
pub type Ticket = u64;

pub type EventSender = mpsc::Sender<SessionEvent>;
pub type EventReceiver = mpsc::Receiver<SessionEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_BUFFER)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub people_count: u32,
    pub label: Option<String>,
}

impl TryFrom<Analysis> for InferenceResult {
    type Error = TransportError;

    fn try_from(analysis: Analysis) -> Result<Self, Self::Error> {
        match analysis.error {
            Some(message) => Err(TransportError::Backend(message)),
            None => Ok(Self {
                people_count: analysis.people_count,
                label: analysis.label,
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("No response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("Backend reported an error: {0}")]
    Backend(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TransportError {
    /// Short label used for metrics attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::ConnectFailed { .. } => "connect_failed",
            TransportError::ConnectionLost(_) => "connection_lost",
            TransportError::MalformedResponse(_) => "malformed_response",
            TransportError::ResponseTimeout(_) => "response_timeout",
            TransportError::Backend(_) => "backend",
            TransportError::Http(_) => "http",
            TransportError::WebSocket(_) => "websocket",
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Reply to a send. Request/response replies carry the ticket of their
    /// request; duplex replies answer the most recent unacknowledged send
    /// and carry none.
    Response {
        ticket: Option<Ticket>,
        outcome: Result<InferenceResult, TransportError>,
    },
    /// The duplex channel closed underneath us.
    ConnectionLost(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStyle {
    Duplex,
    RequestResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Connecting, Disconnected)
                | (Open, Closing)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Session state shared between a session and its background tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedSessionState {
    inner: Arc<Mutex<SessionState>>,
}

impl SharedSessionState {
    pub fn get(&self) -> SessionState {
        *self.inner.lock()
    }

    /// Moves to `next` if the edge is allowed. Returns whether it moved.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.inner.lock();
        if state.can_transition_to(next) {
            tracing::debug!(from = %*state, to = %next, "Session state change");
            *state = next;
            true
        } else {
            tracing::warn!(from = %*state, to = %next, "Rejected session state change");
            false
        }
    }

    /// Moves to `next` only when currently in `expected`.
    pub fn advance_from(&self, expected: SessionState, next: SessionState) -> bool {
        let mut state = self.inner.lock();
        if *state == expected && expected.can_transition_to(next) {
            tracing::debug!(from = %*state, to = %next, "Session state change");
            *state = next;
            true
        } else {
            false
        }
    }
}

#[async_trait]
pub trait Transport: Send + 'static {
    fn style(&self) -> DeliveryStyle;

    fn state(&self) -> SessionState;

    /// Opens the session. Outcomes of later sends are delivered on `events`.
    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError>;

    /// Hands one payload to the backend without waiting for the reply.
    /// Fails fast with [`TransportError::NotConnected`] unless open.
    async fn send(&mut self, ticket: Ticket, payload: Payload) -> Result<(), TransportError>;

    /// Releases the connection. Safe to call when already closed.
    async fn close(&mut self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn style(&self) -> DeliveryStyle {
        (**self).style()
    }

    fn state(&self) -> SessionState {
        (**self).state()
    }

    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        (**self).connect(events).await
    }

    async fn send(&mut self, ticket: Ticket, payload: Payload) -> Result<(), TransportError> {
        (**self).send(ticket, payload).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
