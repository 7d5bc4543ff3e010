//! HTTP and WebSocket surface of the hub.
//!
//! `GET /ws` upgrades to the chat protocol; `/health` and `/debug/stats`
//! are plain HTTP.  Each WebSocket connection runs one task that multiplexes
//! its outbound event queue against inbound frames with `tokio::select!`.
//! The queue is the only path events take to a client, so draining it here
//! (and only here) keeps slow sockets isolated to their own connection.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::sync::mpsc;

use crate::hub::HubState;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::tlog;

/// Build the hub's router.
pub fn app(state: HubState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_handler))
        .route("/debug/stats", get(debug_stats))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

async fn debug_stats(State(state): State<HubState>) -> impl IntoResponse {
    Json(state.stats_json().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, ip, state))
}

async fn handle_ws_connection(mut socket: WebSocket, ip: String, state: HubState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = state.connect(tx).await;
    tlog!("server: websocket from {ip} is connection {connection_id}");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match ClientCommand::decode(&text) {
                        Ok(command) => state.handle_command(connection_id, command).await,
                        Err(error) => {
                            // Malformed frames are answered on the offending
                            // connection only and never tear the session down.
                            let reply = ServerEvent::ErrorMessage {
                                message: format!("invalid command: {error}"),
                            };
                            if let Ok(json) = serde_json::to_string(&reply) {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.disconnect(connection_id).await;
    tlog!("server: connection {connection_id} closed");
}
