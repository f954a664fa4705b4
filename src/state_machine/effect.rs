//! Effects produced by state transitions

use super::state::ChatMessage;
use super::step::StepId;
use std::time::Duration;

/// Effects to be executed after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Persist the new flow state as a checkpoint
    PersistCheckpoint,

    /// Emit an assistant message to the output stream
    EmitMessage { message: ChatMessage },

    /// Run a step's collaborator work
    ExecuteStep { step: StepId, attempt: u32 },

    /// Wait, then feed back `RetryElapsed`
    ScheduleRetry {
        step: StepId,
        attempt: u32,
        delay: Duration,
    },

    /// Tell connected clients something about the turn
    Notify(Notification),
}

/// Client-facing notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AwaitingInput { step: StepId },
    ConversationComplete,
    /// A step exhausted its retries
    Unavailable { step: StepId, message: String },
}

impl Effect {
    pub fn execute(step: StepId) -> Self {
        Effect::ExecuteStep { step, attempt: 1 }
    }

    pub fn emit(message: ChatMessage) -> Self {
        Effect::EmitMessage { message }
    }

    pub fn awaiting_input(step: StepId) -> Self {
        Effect::Notify(Notification::AwaitingInput { step })
    }

    pub fn complete() -> Self {
        Effect::Notify(Notification::ConversationComplete)
    }
}
