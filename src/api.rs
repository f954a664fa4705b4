//! HTTP and WebSocket transport for conversation threads

mod handlers;
mod sse;
mod types;
mod ws;

pub use handlers::create_router;

use crate::db::Database;
use crate::runtime::{DatabaseStorage, SessionManager};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager<DatabaseStorage>>,
    pub db: Database,
}

impl AppState {
    pub fn new(sessions: SessionManager<DatabaseStorage>, db: Database) -> Self {
        Self {
            sessions: Arc::new(sessions),
            db,
        }
    }
}
