//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ChatRequest, CheckpointSummary, ErrorResponse, HistoryResponse, SuccessResponse,
    ThreadCreatedResponse, ThreadListResponse, ThreadResponse,
};
use super::ws::chat_socket;
use super::AppState;
use crate::db::DbError;
use crate::runtime::{EngineError, RunOutcome};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Threads
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/:id", get(get_thread))
        .route("/api/threads/:id/history", get(get_history))
        // Turns
        .route("/api/threads/:id/messages", post(send_message))
        .route("/api/threads/:id/reset", post(reset_thread))
        // Streaming
        .route("/api/threads/:id/stream", get(stream_thread))
        .route("/chat", get(chat_socket))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Threads
// ============================================================

async fn list_threads(
    State(state): State<AppState>,
) -> Result<Json<ThreadListResponse>, AppError> {
    let threads = state.db.list_threads()?;
    Ok(Json(ThreadListResponse { threads }))
}

async fn create_thread(
    State(state): State<AppState>,
) -> Result<Json<ThreadCreatedResponse>, AppError> {
    let id = state.sessions.create_session().await?;
    Ok(Json(ThreadCreatedResponse {
        id,
        messages: Vec::new(),
    }))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ThreadResponse>, AppError> {
    let thread = state.db.get_thread(&id)?;
    let flow = state.sessions.state(&id).await?;
    Ok(Json(ThreadResponse {
        thread,
        position: flow.position,
        messages: flow.conversation.messages,
        collected_email: flow.conversation.collected_email,
        terminal_flags: flow.conversation.terminal_flags,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, AppError> {
    state.db.get_thread(&id)?;
    let checkpoints = state
        .db
        .checkpoint_history(&id)?
        .into_iter()
        .map(|cp| CheckpointSummary {
            sequence: cp.sequence,
            position: cp.state.position,
            created_at: cp.created_at,
        })
        .collect();
    Ok(Json(HistoryResponse { checkpoints }))
}

// ============================================================
// Turns
// ============================================================

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<RunOutcome>, AppError> {
    // No text resumes the thread without input, re-running a failed step
    let outcome = state.sessions.send(&id, req.into_input()).await?;
    Ok(Json(outcome))
}

async fn reset_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.sessions.reset(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Streaming
// ============================================================

async fn stream_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let snapshot = state.sessions.state(&id).await?;
    let broadcast_rx = state.sessions.subscribe(&id).await?;
    Ok(sse_stream(id, snapshot, broadcast_rx))
}

async fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub(super) enum AppError {
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ThreadNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ThreadNotFound(_) => AppError::NotFound(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
