use super::{
    DeliveryStyle, EventSender, InferenceResult, SessionEvent, SessionState, SharedSessionState,
    Ticket, Transport, TransportError,
};
use crate::encoder::Payload;
use async_trait::async_trait;
use frame_proto::ServerMessage;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Long-lived WebSocket channel: one text frame out per payload, tagged JSON
/// messages in, read by a background task.
pub struct WebSocketSession {
    endpoint: String,
    connect_timeout: Duration,
    state: SharedSessionState,
    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketSession {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            state: SharedSessionState::default(),
            sink: None,
            reader: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect_failed(&self, reason: impl Into<String>) -> TransportError {
        TransportError::ConnectFailed {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }

    fn release(&mut self) {
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Transport for WebSocketSession {
    fn style(&self) -> DeliveryStyle {
        DeliveryStyle::Duplex
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        if self.state.get() == SessionState::Open {
            return Ok(());
        }

        self.release();
        if !self.state.advance(SessionState::Connecting) {
            return Err(self.connect_failed(format!("session is {}", self.state.get())));
        }

        tracing::debug!(endpoint = %self.endpoint, "Opening duplex session");
        let stream = match timeout(self.connect_timeout, connect_async(self.endpoint.as_str())).await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.state.advance(SessionState::Disconnected);
                return Err(self.connect_failed(e.to_string()));
            }
            Err(_) => {
                self.state.advance(SessionState::Disconnected);
                return Err(self.connect_failed(format!("timed out after {:?}", self.connect_timeout)));
            }
        };

        let (sink, stream) = stream.split();
        self.state.advance(SessionState::Open);
        self.sink = Some(sink);
        self.reader = Some(tokio::spawn(read_messages(
            stream,
            self.state.clone(),
            events,
        )));

        tracing::info!(endpoint = %self.endpoint, "Duplex session open");
        Ok(())
    }

    async fn send(&mut self, ticket: Ticket, payload: Payload) -> Result<(), TransportError> {
        if self.state.get() != SessionState::Open {
            return Err(TransportError::NotConnected);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        tracing::debug!(ticket, bytes = payload.len(), "Sending frame over duplex session");
        if let Err(e) = sink.send(Message::text(payload.into_string())).await {
            tracing::warn!(error = %e, "Failed to write frame, dropping duplex session");
            if self
                .state
                .advance_from(SessionState::Open, SessionState::Closing)
            {
                self.state.advance(SessionState::Disconnected);
            }
            self.release();
            return Err(TransportError::ConnectionLost(e.to_string()));
        }

        Ok(())
    }

    async fn close(&mut self) {
        if self
            .state
            .advance_from(SessionState::Open, SessionState::Closing)
        {
            if let Some(mut sink) = self.sink.take() {
                let goodbye = async {
                    sink.send(Message::Close(None)).await?;
                    sink.close().await
                };
                if let Ok(Err(e)) = timeout(self.connect_timeout, goodbye).await {
                    tracing::debug!(error = %e, "Close handshake failed");
                }
            }
            self.state.advance(SessionState::Disconnected);
            tracing::info!(endpoint = %self.endpoint, "Duplex session closed");
        }
        self.release();
    }
}

async fn read_messages(
    mut stream: SplitStream<WsStream>,
    state: SharedSessionState,
    events: EventSender,
) {
    let reason = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };

        let event = match message {
            Message::Text(text) => interpret(ServerMessage::from_json(text.as_str())),
            Message::Binary(data) => interpret(ServerMessage::from_slice(&data)),
            Message::Close(frame) => {
                break match frame {
                    Some(frame) => format!(
                        "closed by backend ({}): {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    ),
                    None => "closed by backend".to_string(),
                }
            }
            _ => continue,
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                tracing::debug!("Event receiver dropped, stopping duplex reader");
                return;
            }
        }
    };

    if state.advance_from(SessionState::Open, SessionState::Closing) {
        state.advance(SessionState::Disconnected);
        tracing::warn!(reason = %reason, "Duplex session lost");
        let _ = events
            .send(SessionEvent::ConnectionLost(TransportError::ConnectionLost(
                reason,
            )))
            .await;
    }
}

/// Maps one inbound message to an event. Greetings and malformed messages
/// yield nothing and leave the session open.
pub(crate) fn interpret(parsed: Result<ServerMessage, serde_json::Error>) -> Option<SessionEvent> {
    match parsed {
        Ok(ServerMessage::ImageAnalysis { data }) => Some(SessionEvent::Response {
            ticket: None,
            outcome: InferenceResult::try_from(data),
        }),
        Ok(ServerMessage::Error { message }) => Some(SessionEvent::Response {
            ticket: None,
            outcome: Err(TransportError::Backend(message)),
        }),
        Ok(ServerMessage::Connection { message }) => {
            tracing::info!(message = %message, "Backend greeting");
            None
        }
        Err(e) => {
            let error = TransportError::MalformedResponse(e.to_string());
            tracing::warn!(error = %error, "Discarding inbound message");
            None
        }
    }
}
