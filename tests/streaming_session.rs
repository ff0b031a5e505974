//! Streaming-session tests driving the real /ws endpoint over a socket.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use ridelens_gateway::auth::JwtConfig;
use ridelens_gateway::cache::MemoryCache;
use ridelens_gateway::data_url::encode_data_url;
use ridelens_gateway::frame_processor::FrameProcessor;
use ridelens_gateway::inference_client::{InferenceClient, InferenceConfig};
use ridelens_gateway::models::SystemStats;
use ridelens_gateway::rate_limiter::RateLimiter;
use ridelens_gateway::state::{AppConfig, AppState};
use ridelens_gateway::web_api;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Clone)]
struct StubState {
    calls: Arc<AtomicUsize>,
}

async fn stub_analyze(State(stub): State<StubState>) -> Json<serde_json::Value> {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "overall_score": 90,
        "posture_score": 80,
        "lane_score": 90,
        "speed_score": 90,
        "detections": [],
        "pose_keypoints": [],
        "scene_analysis": {},
        "processing_time": 1.0,
        "model_version": "stub-v1",
    }))
}

/// Start the full gateway (stub inference behind it) with the given session
/// timings; returns the WebSocket URL and the inference call counter.
async fn spawn_gateway(
    read_deadline: Duration,
    ping_interval: Duration,
) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let stub = Router::new()
        .route("/analyze", post(stub_analyze))
        .route("/health", get(|| async { "ok" }))
        .with_state(StubState {
            calls: calls.clone(),
        });
    let stub_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stub_addr = stub_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(stub_listener, stub).await.unwrap();
    });

    let inference = Arc::new(
        InferenceClient::new(InferenceConfig {
            base_url: format!("http://{}", stub_addr),
            timeout: Duration::from_secs(30),
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
            health_check_interval: Duration::from_secs(30),
        })
        .unwrap(),
    );
    let cache = MemoryCache::new(1000, Duration::from_secs(300));
    let processor = FrameProcessor::new(inference, cache);

    let mut config = AppConfig::default();
    config.server.session_read_deadline = read_deadline;
    config.server.session_ping_interval = ping_interval;

    let state = AppState {
        processor,
        rate_limiter: RateLimiter::new(100, 200),
        system_stats: Arc::new(RwLock::new(SystemStats::default())),
        jwt: JwtConfig {
            secret: "test-secret".to_string(),
        },
        config,
    };

    let app = web_api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    (format!("ws://{}/ws", addr), calls)
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Receive the next data message. Every text frame must parse as one
/// complete JSON document: a torn or interleaved write would fail here.
async fn recv_server_message(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("session closed unexpectedly")
            .expect("websocket read error");
        match message {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("incomplete JSON frame")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn session_orders_pong_analysis_pong() {
    let (url, calls) = spawn_gateway(Duration::from_secs(60), Duration::from_secs(54)).await;
    let (mut ws, _response) = connect_async(url.as_str()).await.unwrap();

    send_json(&mut ws, json!({"type": "ping"})).await;
    let first = recv_server_message(&mut ws).await;
    assert_eq!(first["type"], "pong");
    assert!(first["data"]["timestamp"].is_i64());

    send_json(
        &mut ws,
        json!({
            "type": "frame",
            "data": encode_data_url(b"session-frame-bytes"),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }),
    )
    .await;
    let analysis = recv_server_message(&mut ws).await;
    assert_eq!(analysis["type"], "analysis");
    assert_eq!(analysis["data"]["overall_score"], 90);
    let feedback = recv_server_message(&mut ws).await;
    assert_eq!(feedback["type"], "feedback");
    assert_eq!(
        feedback["data"]["message"],
        "Great riding! Keep up the good work"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    send_json(&mut ws, json!({"type": "ping"})).await;
    let second = recv_server_message(&mut ws).await;
    assert_eq!(second["type"], "pong");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn session_survives_bad_messages_and_applies_config() {
    let (url, _calls) = spawn_gateway(Duration::from_secs(60), Duration::from_secs(54)).await;
    let (mut ws, _response) = connect_async(url.as_str()).await.unwrap();

    send_json(
        &mut ws,
        json!({"type": "config", "data": r#"{"max_workers": 2}"#}),
    )
    .await;
    let updated = recv_server_message(&mut ws).await;
    assert_eq!(updated["type"], "config_updated");
    assert_eq!(updated["data"]["status"], "success");
    assert_eq!(updated["data"]["config"]["max_workers"], 2);

    send_json(&mut ws, json!({"type": "telemetry"})).await;
    let unknown = recv_server_message(&mut ws).await;
    assert_eq!(unknown["type"], "error");
    assert!(unknown["data"]["message"]
        .as_str()
        .unwrap()
        .contains("Unknown message type"));

    send_json(
        &mut ws,
        json!({"type": "frame", "data": "not-a-data-url", "timestamp": 0}),
    )
    .await;
    let invalid = recv_server_message(&mut ws).await;
    assert_eq!(invalid["type"], "error");
    assert_eq!(invalid["data"]["message"], "invalid image data format");

    // The session is still serviceable after every rejected message.
    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_server_message(&mut ws).await["type"], "pong");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn silent_session_is_closed_at_read_deadline() {
    // Ping interval longer than the deadline: nothing refreshes it.
    let (url, _calls) = spawn_gateway(Duration::from_secs(1), Duration::from_secs(30)).await;
    let (mut ws, _response) = connect_async(url.as_str()).await.unwrap();

    let started = std::time::Instant::now();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("session not closed after read deadline"),
        }
    }

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(started.elapsed() < Duration::from_secs(5));
}
