//! Events that drive state transitions

use super::state::StateUpdate;
use super::step::StepId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of a failed step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Collaborator call exceeded its deadline
    Timeout,
    Network,
    RateLimit,
    ServerError,
    /// Collaborator answered with output that does not fit the expected shape
    MalformedOutput,
    Auth,
    InvalidRequest,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::ServerError
        )
    }

    /// Classify a non-success HTTP status from any collaborator
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            400 | 404 | 422 => ErrorKind::InvalidRequest,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Events fed to [`super::transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `run` was called, with optional user input
    Resume { input: Option<String> },

    /// A step finished and produced a partial update
    StepCompleted { step: StepId, update: StateUpdate },

    /// A step's collaborator call failed
    StepFailed {
        step: StepId,
        attempt: u32,
        message: String,
        error_kind: ErrorKind,
        /// Earliest retry the collaborator asked for
        retry_after: Option<Duration>,
    },

    /// Backoff elapsed for a scheduled retry
    RetryElapsed { step: StepId, attempt: u32 },
}

impl Event {
    pub fn resume(input: Option<&str>) -> Self {
        Event::Resume {
            input: input.map(str::to_string),
        }
    }
}
