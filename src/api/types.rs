//! API request and response types

use crate::db::Thread;
use crate::state_machine::{ChatMessage, Position, TerminalFlags};
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatRequest {
    /// Turn input; blank text counts as none
    pub fn into_input(self) -> Option<String> {
        self.text.filter(|t| !t.trim().is_empty())
    }
}

/// Newly created thread
#[derive(Debug, Serialize)]
pub struct ThreadCreatedResponse {
    pub id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct ThreadListResponse {
    pub threads: Vec<Thread>,
}

/// Thread with its latest checkpointed state
#[derive(Debug, Serialize)]
pub struct ThreadResponse {
    pub thread: Thread,
    pub position: Position,
    pub messages: Vec<ChatMessage>,
    pub collected_email: Option<String>,
    pub terminal_flags: TerminalFlags,
}

/// One checkpoint in a thread's history
#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub sequence: i64,
    pub position: Position,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub checkpoints: Vec<CheckpointSummary>,
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
