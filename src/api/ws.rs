//! WebSocket chat transport
//!
//! Text frames in are user replies; JSON frames out are [`FlowEvent`]s.
//! Replies are processed in order, one turn at a time. Closing the socket
//! mid-turn leaves the turn running to completion on the server.

use super::handlers::AppError;
use super::types::ChatRequest;
use super::AppState;
use crate::runtime::{EngineError, FlowEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
pub struct ChatParams {
    /// Existing thread to resume; a new one is created when absent
    pub thread_id: Option<String>,
}

pub async fn chat_socket(
    ws: WebSocketUpgrade,
    Query(params): Query<ChatParams>,
    State(state): State<AppState>,
) -> Response {
    let thread_id = match params.thread_id {
        Some(id) => match state.sessions.status(&id).await {
            Ok(_) => id,
            Err(e) => return AppError::from(e).into_response(),
        },
        None => match state.sessions.create_session().await {
            Ok(id) => id,
            Err(e) => return AppError::from(e).into_response(),
        },
    };

    ws.on_upgrade(move |socket| handle_socket(socket, thread_id, state))
}

async fn handle_socket(socket: WebSocket, thread_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(thread_id = %thread_id, "WebSocket connection established");

    let hello = json!({ "type": "session", "thread_id": thread_id }).to_string();
    if sender.send(Message::Text(hello)).await.is_err() {
        return;
    }

    let mut events = match state.sessions.subscribe(&thread_id).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::warn!(thread_id = %thread_id, error = %e, "Cannot subscribe to thread");
            return;
        }
    };
    let forward_id = thread_id.clone();
    let mut forward = tokio::spawn(async move {
        loop {
            let event: FlowEvent = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(thread_id = %forward_id, skipped, "WebSocket client lagging");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Ok(frame) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    run_turn(&state, &thread_id, text).await;
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            // Forwarder ends when the client stops accepting frames
            _ = &mut forward => break,
        }
    }

    forward.abort();
    tracing::info!(thread_id = %thread_id, "WebSocket connection closed");
}

async fn run_turn(state: &AppState, thread_id: &str, text: String) {
    let input = ChatRequest { text: Some(text) }.into_input();
    match state.sessions.send(thread_id, input).await {
        Ok(_) => {}
        Err(EngineError::ThreadNotFound(_)) => {
            tracing::warn!(thread_id, "Thread vanished during WebSocket session");
        }
        Err(e) => tracing::error!(thread_id, error = %e, "Turn failed"),
    }
}
