use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use frame_proto::{Analysis, FrameRequest, DATA_URL_JPEG_PREFIX};
use frame_streamer::{
    encoder::{JpegDataUrlEncoder, Payload},
    frame::SyntheticSource,
    session::{
        event_channel, HttpSession, InferenceResult, SessionEvent, SessionState, Transport,
        TransportError, WebSocketSession,
    },
    telemetry::Metrics,
    StreamingController, StreamingSettings,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn sample_payload() -> Payload {
    Payload::new(format!("{}AAAA", DATA_URL_JPEG_PREFIX))
}

// Greets, then answers every frame with one malformed message followed by
// an analysis carrying a running count.
async fn counting_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let greeting = r#"{"type":"connection","message":"Connected to image stream server"}"#;
        if socket.send(Message::Text(greeting.into())).await.is_err() {
            return;
        }

        let mut count = 0;
        while let Some(Ok(message)) = socket.recv().await {
            let Message::Text(text) = message else {
                continue;
            };
            if !text.as_str().starts_with(DATA_URL_JPEG_PREFIX) {
                continue;
            }
            count += 1;
            let reply = serde_json::json!({
                "type": "image_analysis",
                "data": { "people_count": count },
            });
            if socket
                .send(Message::Text(r#"{"foo":"bar"}"#.into()))
                .await
                .is_err()
                || socket
                    .send(Message::Text(reply.to_string().into()))
                    .await
                    .is_err()
            {
                return;
            }
        }
    })
}

// Hangs up after the first frame.
async fn hanging_up_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        if let Some(Ok(_)) = socket.recv().await {
            let _ = socket.send(Message::Close(None)).await;
        }
    })
}

#[tokio::test]
async fn test_duplex_session_skips_noise_and_delivers_analysis() {
    let addr = serve(Router::new().route("/ws", get(counting_ws))).await;
    let (events, mut rx) = event_channel();
    let mut session = WebSocketSession::new(format!("ws://{}/ws", addr), Duration::from_secs(2));

    session.connect(events).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);

    for expected in 1..=2 {
        session.send(expected as u64, sample_payload()).await.unwrap();
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        match event {
            Some(SessionEvent::Response {
                ticket: None,
                outcome: Ok(result),
            }) => assert_eq!(result.people_count, expected),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(session.state(), SessionState::Open);

    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_duplex_remote_close_is_reported_and_session_reconnects() {
    let addr = serve(Router::new().route("/ws", get(hanging_up_ws))).await;
    let (events, mut rx) = event_channel();
    let mut session = WebSocketSession::new(format!("ws://{}/ws", addr), Duration::from_secs(2));

    session.connect(events.clone()).await.unwrap();
    session.send(1, sample_payload()).await.unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert!(matches!(
        event,
        Some(SessionEvent::ConnectionLost(TransportError::ConnectionLost(_)))
    ));
    assert_eq!(session.state(), SessionState::Disconnected);

    let err = session.send(2, sample_payload()).await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));

    session.connect(events).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    session.close().await;
}

async fn process_frame(Json(request): Json<FrameRequest>) -> impl IntoResponse {
    if !request.image.starts_with(DATA_URL_JPEG_PREFIX) {
        return (StatusCode::BAD_REQUEST, "expected a jpeg data url").into_response();
    }
    Json(Analysis::count(2)).into_response()
}

async fn failing_model(Json(_): Json<FrameRequest>) -> Json<Analysis> {
    Json(Analysis {
        people_count: 0,
        label: None,
        error: Some("model failed".to_string()),
    })
}

async fn broken(Json(_): Json<FrameRequest>) -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn slow(Json(_): Json<FrameRequest>) -> Json<Analysis> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(Analysis::count(1))
}

async fn not_json(Json(_): Json<FrameRequest>) -> &'static str {
    "people: lots"
}

async fn http_outcome(addr: SocketAddr, path: &str) -> Result<InferenceResult, TransportError> {
    let (events, mut rx) = event_channel();
    let mut session = HttpSession::new(
        format!("http://{}{}", addr, path),
        Duration::from_secs(1),
        Duration::from_millis(300),
    )
    .unwrap();

    session.connect(events).await.unwrap();
    session.send(42, sample_payload()).await.unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    session.close().await;
    match event {
        Some(SessionEvent::Response {
            ticket: Some(42),
            outcome,
        }) => outcome,
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_request_response_outcomes() {
    let addr = serve(
        Router::new()
            .route("/process_frame", post(process_frame))
            .route("/failing_model", post(failing_model))
            .route("/broken", post(broken))
            .route("/slow", post(slow))
            .route("/not_json", post(not_json)),
    )
    .await;

    let result = http_outcome(addr, "/process_frame").await.unwrap();
    assert_eq!(result.people_count, 2);

    assert!(matches!(
        http_outcome(addr, "/failing_model").await,
        Err(TransportError::Backend(message)) if message == "model failed"
    ));
    assert!(matches!(
        http_outcome(addr, "/broken").await,
        Err(TransportError::Http(_))
    ));
    assert!(matches!(
        http_outcome(addr, "/slow").await,
        Err(TransportError::ResponseTimeout(_))
    ));
    assert!(matches!(
        http_outcome(addr, "/not_json").await,
        Err(TransportError::MalformedResponse(_))
    ));
}

#[derive(Clone, Default)]
struct FrameCounter {
    frames: Arc<AtomicU32>,
}

async fn counting_frames(
    State(counter): State<FrameCounter>,
    Json(request): Json<FrameRequest>,
) -> impl IntoResponse {
    if !request.image.starts_with(DATA_URL_JPEG_PREFIX) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let seen = counter.frames.fetch_add(1, Ordering::SeqCst) + 1;
    Json(Analysis::count(seen)).into_response()
}

#[tokio::test]
async fn test_controller_streams_synthetic_frames_over_http() {
    let counter = FrameCounter::default();
    let addr = serve(
        Router::new()
            .route("/process_frame", post(counting_frames))
            .with_state(counter.clone()),
    )
    .await;

    let transport = HttpSession::new(
        format!("http://{}/process_frame", addr),
        Duration::from_secs(1),
        Duration::from_secs(2),
    )
    .unwrap();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let delivered = delivered.clone();
        move |result: InferenceResult| delivered.lock().unwrap().push(result.people_count)
    };

    let mut controller = StreamingController::new(
        SyntheticSource::new(64, 48).unwrap(),
        JpegDataUrlEncoder::default(),
        transport,
        sink,
        StreamingSettings::new(Duration::from_millis(50)),
        Arc::new(Metrics::new().unwrap()),
    );

    controller.start().unwrap();
    timeout(Duration::from_secs(10), async {
        while delivered.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    controller.stop().await;

    let seen = delivered.lock().unwrap().clone();
    assert_eq!(&seen[..3], &[1, 2, 3]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.lock().unwrap().len(), seen.len());
}

#[derive(Debug, PartialEq, Eq)]
enum SocketActivity {
    Frame,
    Closed,
}

// Never answers; reports every frame and the moment the client goes away.
async fn silent_ws(
    State(activity): State<mpsc::UnboundedSender<SocketActivity>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(_))) => {
                    let _ = activity.send(SocketActivity::Frame);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        let _ = activity.send(SocketActivity::Closed);
    })
}

#[tokio::test]
async fn test_dropping_running_controller_closes_duplex_socket() {
    let (activity_tx, mut activity) = mpsc::unbounded_channel();
    let addr = serve(
        Router::new()
            .route("/ws", get(silent_ws))
            .with_state(activity_tx),
    )
    .await;

    let mut controller = StreamingController::new(
        SyntheticSource::new(16, 12).unwrap(),
        JpegDataUrlEncoder::default(),
        WebSocketSession::new(format!("ws://{}/ws", addr), Duration::from_secs(2)),
        |_: InferenceResult| {},
        StreamingSettings::new(Duration::from_millis(50)),
        Arc::new(Metrics::new().unwrap()),
    );
    controller.start().unwrap();

    let first = timeout(Duration::from_secs(5), activity.recv()).await.unwrap();
    assert_eq!(first, Some(SocketActivity::Frame));

    drop(controller);

    let closed = timeout(Duration::from_secs(5), async {
        while let Some(event) = activity.recv().await {
            if event == SocketActivity::Closed {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed);
}
