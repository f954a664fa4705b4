//! Runtime for executing conversation flows
//!
//! The [`FlowExecutor`] owns the graph, the checkpoint store and the step
//! collaborators. [`SessionManager`] sits on top of it and gives transports
//! a thread-oriented surface: create a session, send input, subscribe to the
//! event stream.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{EngineError, FlowExecutor, RunOutcome};
pub use traits::*;

use crate::state_machine::{ChatMessage, FlowState, Position, StepId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Executor backed by the SQLite store
pub type ProductionExecutor = FlowExecutor<DatabaseStorage>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events pushed to connected clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A streamed fragment of the assistant reply in progress
    Token { text: String },
    /// Discard tokens streamed so far for `step`; its attempt failed
    StreamReset { step: StepId },
    /// A complete assistant message
    Message { message: ChatMessage },
    /// The flow halted and waits for the user
    AwaitingInput { step: StepId },
    /// A step failed after retries; the turn can be retried later
    Unavailable { step: StepId, message: String },
    #[serde(rename = "complete")]
    ConversationComplete,
    /// The run returned; emitted exactly once per `send`
    #[serde(rename = "end_of_turn")]
    TurnEnd { next_step: Option<StepId> },
}

impl FlowEvent {
    /// Wire name, matching the serialized `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            FlowEvent::Token { .. } => "token",
            FlowEvent::StreamReset { .. } => "stream_reset",
            FlowEvent::Message { .. } => "message",
            FlowEvent::AwaitingInput { .. } => "awaiting_input",
            FlowEvent::Unavailable { .. } => "unavailable",
            FlowEvent::ConversationComplete => "complete",
            FlowEvent::TurnEnd { .. } => "end_of_turn",
        }
    }
}

/// Thread-oriented front door for transports
pub struct SessionManager<S: CheckpointStore + 'static> {
    executor: Arc<FlowExecutor<S>>,
    channels: RwLock<HashMap<String, broadcast::Sender<FlowEvent>>>,
}

impl<S: CheckpointStore + 'static> SessionManager<S> {
    pub fn new(executor: FlowExecutor<S>) -> Self {
        Self {
            executor: Arc::new(executor),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh thread id with no checkpoint
    pub async fn create_session(&self) -> Result<String, EngineError> {
        let thread_id = uuid::Uuid::new_v4().to_string();
        self.executor.create(&thread_id).await?;
        tracing::info!(thread_id = %thread_id, "Session created");
        Ok(thread_id)
    }

    /// Receive every event emitted for the thread from now on
    pub async fn subscribe(
        &self,
        thread_id: &str,
    ) -> Result<broadcast::Receiver<FlowEvent>, EngineError> {
        self.executor.ensure_exists(thread_id).await?;
        Ok(self.channel(thread_id).await.subscribe())
    }

    /// Run one turn with optional user input.
    ///
    /// The run executes on its own task; dropping the returned future (a
    /// client disconnecting) does not cancel it, and whatever it persisted
    /// stays in place.
    pub async fn send(
        &self,
        thread_id: &str,
        input: Option<String>,
    ) -> Result<RunOutcome, EngineError> {
        self.executor.ensure_exists(thread_id).await?;
        let events = self.channel(thread_id).await;
        let executor = Arc::clone(&self.executor);
        let id = thread_id.to_string();

        tokio::spawn(async move { executor.run(&id, input.as_deref(), &events).await })
            .await
            .map_err(|e| EngineError::Aborted(e.to_string()))?
    }

    pub async fn reset(&self, thread_id: &str) -> Result<(), EngineError> {
        self.executor.reset(thread_id).await
    }

    pub async fn status(&self, thread_id: &str) -> Result<Position, EngineError> {
        self.executor.status(thread_id).await
    }

    pub async fn state(&self, thread_id: &str) -> Result<FlowState, EngineError> {
        self.executor.state(thread_id).await
    }

    #[cfg(test)]
    pub(crate) async fn open_channels(&self) -> usize {
        self.channels.read().await.len()
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.executor.tracked_locks()
    }

    async fn channel(&self, thread_id: &str) -> broadcast::Sender<FlowEvent> {
        if let Some(tx) = self.channels.read().await.get(thread_id) {
            return tx.clone();
        }
        self.channels
            .write()
            .await
            .entry(thread_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }
}
