use super::{
    DeliveryStyle, EventSender, InferenceResult, SessionEvent, SessionState, SharedSessionState,
    Ticket, Transport, TransportError,
};
use crate::encoder::Payload;
use async_trait::async_trait;
use frame_proto::{Analysis, FrameRequest};
use std::time::Duration;
use tokio::task::JoinSet;

/// One short-lived POST per frame. Calls complete independently and report
/// back with the ticket of the frame they carried.
pub struct HttpSession {
    client: reqwest::Client,
    endpoint: String,
    response_timeout: Duration,
    state: SharedSessionState,
    events: Option<EventSender>,
    in_flight: JoinSet<()>,
}

impl HttpSession {
    pub fn new(
        endpoint: impl Into<String>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(response_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            response_timeout,
            state: SharedSessionState::default(),
            events: None,
            in_flight: JoinSet::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.in_flight.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(error = %e, "Frame request task panicked");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpSession {
    fn style(&self) -> DeliveryStyle {
        DeliveryStyle::RequestResponse
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    async fn connect(&mut self, events: EventSender) -> Result<(), TransportError> {
        match self.state.get() {
            SessionState::Open => return Ok(()),
            SessionState::Disconnected => {}
            other => {
                return Err(TransportError::ConnectFailed {
                    endpoint: self.endpoint.clone(),
                    reason: format!("session is {}", other),
                })
            }
        }

        self.state.advance(SessionState::Connecting);
        self.events = Some(events);
        self.state.advance(SessionState::Open);
        tracing::info!(endpoint = %self.endpoint, "Request/response session ready");
        Ok(())
    }

    async fn send(&mut self, ticket: Ticket, payload: Payload) -> Result<(), TransportError> {
        if self.state.get() != SessionState::Open {
            return Err(TransportError::NotConnected);
        }
        let Some(events) = self.events.clone() else {
            return Err(TransportError::NotConnected);
        };

        self.reap_finished();

        tracing::debug!(ticket, bytes = payload.len(), "Posting frame");
        let request = self.client.post(&self.endpoint).json(&FrameRequest {
            image: payload.into_string(),
        });
        let response_timeout = self.response_timeout;

        self.in_flight.spawn(async move {
            let outcome = request_analysis(request, response_timeout).await;
            if events
                .send(SessionEvent::Response {
                    ticket: Some(ticket),
                    outcome,
                })
                .await
                .is_err()
            {
                tracing::debug!(ticket, "Session torn down, dropping response");
            }
        });

        Ok(())
    }

    async fn close(&mut self) {
        if self
            .state
            .advance_from(SessionState::Open, SessionState::Closing)
        {
            self.in_flight.abort_all();
            while self.in_flight.join_next().await.is_some() {}
            self.events = None;
            self.state.advance(SessionState::Disconnected);
            tracing::info!(endpoint = %self.endpoint, "Request/response session closed");
        }
    }
}

async fn request_analysis(
    request: reqwest::RequestBuilder,
    response_timeout: Duration,
) -> Result<InferenceResult, TransportError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            TransportError::ResponseTimeout(response_timeout)
        } else {
            TransportError::Http(e)
        }
    })?;

    let response = response.error_for_status()?;
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            TransportError::ResponseTimeout(response_timeout)
        } else {
            TransportError::Http(e)
        }
    })?;

    let analysis: Analysis = serde_json::from_slice(&body)
        .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

    InferenceResult::try_from(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::event_channel;

    #[tokio::test]
    async fn test_send_requires_open_session() {
        let mut session = HttpSession::new(
            "http://127.0.0.1:9/process_frame",
            Duration::from_millis(100),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = session.send(1, Payload::new("frame")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_failure_per_request() {
        let (events, mut rx) = event_channel();
        let mut session = HttpSession::new(
            "http://127.0.0.1:9/process_frame",
            Duration::from_millis(200),
            Duration::from_millis(500),
        )
        .unwrap();

        session.connect(events).await.unwrap();
        assert_eq!(session.state(), SessionState::Open);

        session.send(7, Payload::new("frame")).await.unwrap();
        match rx.recv().await {
            Some(SessionEvent::Response {
                ticket: Some(7),
                outcome: Err(_),
            }) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        // The failure does not poison the session.
        session.send(8, Payload::new("frame")).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Response {
                ticket: Some(8),
                ..
            })
        ));

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
