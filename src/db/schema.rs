//! Database schema and types

use crate::state_machine::{FlowState, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threads_updated ON threads(updated_at DESC);

-- Append-only log; the row with the highest sequence is the live checkpoint
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    position TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (thread_id, sequence),
    FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
);
";

/// Thread record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checkpoint_count: i64,
}

/// One persisted snapshot of a thread's flow state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub sequence: i64,
    pub state: FlowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn position(&self) -> &Position {
        &self.state.position
    }
}
