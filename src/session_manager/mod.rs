//! Streaming session manager
//!
//! ## Responsibilities
//!
//! - Upgrade HTTP requests to persistent WebSocket sessions
//! - Liveness: read deadline (default 60 s) refreshed on pong, protocol
//!   pings (default 54 s); both configurable via `ServerConfig`
//! - Per-session write serialization (one mutex guards the sink)
//! - Dispatch client messages; each frame is processed on its own task
//!
//! Results can return out of arrival order; clients correlate by the
//! `timestamp` field they sent. A send on a closed session is logged and
//! discarded.

use crate::data_url::decode_data_url;
use crate::models::FrameRequest;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

/// Largest accepted inbound message
const READ_LIMIT: usize = 10 * 1024 * 1024;

/// Inbound message shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// Outbound message shape
#[derive(Debug, Serialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// One live connection. The session owns the write half of its socket.
struct Session {
    id: Uuid,
    client_id: String,
    writer: Mutex<SplitSink<WebSocket, Message>>,
}

impl Session {
    /// Serialize and write one logical message atomically.
    async fn send_message(&self, kind: &str, data: serde_json::Value) {
        let message = ServerMessage {
            kind: kind.to_string(),
            data,
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Failed to serialize message");
                return;
            }
        };

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Text(json.into())).await {
            tracing::debug!(session_id = %self.id, error = %e, "Dropped message for closed session");
        }
    }

    async fn send_error(&self, message: &str) {
        self.send_message(
            "error",
            json!({
                "message": message,
                "timestamp": Utc::now().timestamp(),
            }),
        )
        .await;
    }

    /// Protocol-level ping through the same write mutex as data frames.
    async fn send_ping(&self) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.send(Message::Ping(Bytes::new())).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Failed to send ping");
                false
            }
        }
    }
}

/// HTTP handler that upgrades the connection to a streaming session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(READ_LIMIT)
        .on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Manage one session: a ping task plus the deadline-bounded read loop.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let read_deadline = state.config.server.session_read_deadline;
    let ping_interval = state.config.server.session_ping_interval;

    let (writer, mut reader) = socket.split();
    let session = Arc::new(Session {
        id: Uuid::new_v4(),
        client_id: addr.ip().to_string(),
        writer: Mutex::new(writer),
    });
    let done = Arc::new(Notify::new());

    tracing::info!(
        session_id = %session.id,
        client_id = %session.client_id,
        "WebSocket client connected"
    );

    let ping_session = session.clone();
    let ping_done = done.clone();
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !ping_session.send_ping().await {
                // notify_one leaves a permit if the read loop is mid-dispatch
                ping_done.notify_one();
                break;
            }
        }
    });

    let mut deadline = Instant::now() + read_deadline;
    loop {
        tokio::select! {
            _ = done.notified() => break,
            next = tokio::time::timeout_at(deadline, reader.next()) => {
                match next {
                    Err(_) => {
                        tracing::info!(session_id = %session.id, "Read deadline expired");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        tracing::debug!(session_id = %session.id, error = %e, "WebSocket read error");
                        break;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Pong(_)))) => {
                        deadline = Instant::now() + read_deadline;
                    }
                    Ok(Some(Ok(Message::Ping(_)))) => {
                        // The protocol library answers pings on flush.
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => dispatch_message(&session, &state, message).await,
                            Err(e) => {
                                tracing::warn!(session_id = %session.id, error = %e, "Unparseable client message");
                                session.send_error("invalid message format").await;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        session.send_error("binary messages are not supported").await;
                    }
                }
            }
        }
    }

    ping_task.abort();
    tracing::info!(session_id = %session.id, "WebSocket client disconnected");
}

/// Route one client message. In-flight frame tasks outlive the session and
/// drop their sends if it closed meanwhile.
async fn dispatch_message(session: &Arc<Session>, state: &AppState, message: ClientMessage) {
    match message.kind.as_str() {
        "frame" => handle_frame(session, state, message).await,
        "ping" => {
            session
                .send_message("pong", json!({"timestamp": Utc::now().timestamp()}))
                .await;
        }
        "config" => handle_config(session, state, message).await,
        other => {
            tracing::warn!(session_id = %session.id, kind = %other, "Unknown message type");
            session
                .send_error(&format!("Unknown message type: {}", other))
                .await;
        }
    }
}

async fn handle_frame(session: &Arc<Session>, state: &AppState, message: ClientMessage) {
    let image_data = match decode_data_url(&message.data) {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            session.send_error("invalid image data format").await;
            return;
        }
        Err(e) => {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to extract image data");
            session.send_error("invalid image data format").await;
            return;
        }
    };

    let request = FrameRequest::new(image_data, message.timestamp, session.client_id.clone());

    let session = session.clone();
    let processor = state.processor.clone();
    tokio::spawn(async move {
        match processor.process_frame(request).await {
            Ok(result) => {
                let feedback = result.feedback.clone();
                match serde_json::to_value(&result) {
                    Ok(value) => session.send_message("analysis", value).await,
                    Err(e) => {
                        tracing::error!(session_id = %session.id, error = %e, "Failed to serialize analysis");
                        return;
                    }
                }
                for item in feedback {
                    session
                        .send_message(
                            "feedback",
                            json!({
                                "message": item.message,
                                "type": item.kind,
                                "score": item.score,
                            }),
                        )
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "Frame processing failed");
                session.send_error("Frame processing failed").await;
            }
        }
    });
}

async fn handle_config(session: &Arc<Session>, state: &AppState, message: ClientMessage) {
    let config: serde_json::Map<String, serde_json::Value> =
        match serde_json::from_str(&message.data) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "Invalid config format");
                session.send_error("Invalid configuration format").await;
                return;
            }
        };

    state.processor.update_config(&config).await;
    session
        .send_message(
            "config_updated",
            json!({
                "status": "success",
                "config": config,
            }),
        )
        .await;
}
