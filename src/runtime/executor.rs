//! Flow executor
//!
//! Loads the checkpoint, feeds events through the pure transition function
//! and carries out the resulting effects until the flow halts. One run per
//! thread at a time: the load-mutate-persist cycle is guarded by a lock
//! keyed by thread id.

use super::traits::CheckpointStore;
use super::FlowEvent;
use crate::state_machine::{
    transition, ChatMessage, Effect, Event, FlowContext, FlowGraph, FlowState, Notification,
    Position, StepId, TransitionError,
};
use crate::steps::StepRunner;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// What users see when a step keeps failing
const UNAVAILABLE_NOTICE: &str =
    "Sorry, I'm temporarily unable to continue this conversation. Please try again in a moment.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Checkpoint store error: {0}")]
    Store(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Run aborted: {0}")]
    Aborted(String),
}

/// Summary of one `run` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Position persisted when the run returned
    pub position: Position,
    /// Assistant messages emitted during this run, in order
    pub messages: Vec<ChatMessage>,
    /// Steps that executed successfully during this run
    pub executed: Vec<StepId>,
    /// Set when a step exhausted its retries
    pub notice: Option<String>,
}

pub struct FlowExecutor<S: CheckpointStore> {
    graph: Arc<FlowGraph>,
    store: S,
    steps: Arc<StepRunner>,
    max_step_attempts: u32,
    retry_base_delay: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: CheckpointStore> FlowExecutor<S> {
    pub fn new(graph: FlowGraph, store: S, steps: StepRunner) -> Self {
        let defaults = FlowContext::new("");
        Self {
            graph: Arc::new(graph),
            store,
            steps: Arc::new(steps),
            max_step_attempts: defaults.max_step_attempts,
            retry_base_delay: defaults.retry_base_delay,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, max_step_attempts: u32, base_delay: Duration) -> Self {
        self.max_step_attempts = max_step_attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    fn context(&self, thread_id: &str) -> FlowContext {
        FlowContext {
            thread_id: thread_id.to_string(),
            max_step_attempts: self.max_step_attempts,
            retry_base_delay: self.retry_base_delay,
        }
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(thread_id.to_string()).or_default())
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn create(&self, thread_id: &str) -> Result<(), EngineError> {
        self.store.create(thread_id).await.map_err(EngineError::Store)
    }

    pub(crate) async fn ensure_exists(&self, thread_id: &str) -> Result<(), EngineError> {
        if self.store.exists(thread_id).await.map_err(EngineError::Store)? {
            Ok(())
        } else {
            Err(EngineError::ThreadNotFound(thread_id.to_string()))
        }
    }

    /// Checkpointed state, or the initial state for a thread that never ran
    pub async fn state(&self, thread_id: &str) -> Result<FlowState, EngineError> {
        self.ensure_exists(thread_id).await?;
        Ok(self
            .store
            .load(thread_id)
            .await
            .map_err(EngineError::Store)?
            .unwrap_or_default())
    }

    pub async fn status(&self, thread_id: &str) -> Result<Position, EngineError> {
        Ok(self.state(thread_id).await?.position)
    }

    /// Drop every checkpoint; the next run starts from the beginning
    pub async fn reset(&self, thread_id: &str) -> Result<(), EngineError> {
        // Only registered threads get a lock entry
        self.ensure_exists(thread_id).await?;
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;
        self.store.reset(thread_id).await.map_err(EngineError::Store)?;
        tracing::info!(thread_id, "Thread reset");
        Ok(())
    }

    /// Resume the thread with optional input and run until it halts.
    ///
    /// Always ends with a [`FlowEvent::TurnEnd`] on `events`.
    pub async fn run(
        &self,
        thread_id: &str,
        input: Option<&str>,
        events: &broadcast::Sender<FlowEvent>,
    ) -> Result<RunOutcome, EngineError> {
        let result = match self.ensure_exists(thread_id).await {
            Ok(()) => {
                let lock = self.thread_lock(thread_id);
                let _guard = lock.lock().await;
                self.drive(thread_id, input, events).await
            }
            Err(e) => Err(e),
        };
        let next_step = match &result {
            Ok(outcome) => {
                tracing::info!(
                    thread_id,
                    position = ?outcome.position,
                    executed = outcome.executed.len(),
                    emitted = outcome.messages.len(),
                    "Run finished"
                );
                outcome.position.next_step()
            }
            Err(e) => {
                tracing::error!(thread_id, error = %e, "Run failed");
                None
            }
        };
        let _ = events.send(FlowEvent::TurnEnd { next_step });
        result
    }

    async fn drive(
        &self,
        thread_id: &str,
        input: Option<&str>,
        events: &broadcast::Sender<FlowEvent>,
    ) -> Result<RunOutcome, EngineError> {
        let mut state = self.state(thread_id).await?;
        let context = self.context(thread_id);
        let mut outcome = RunOutcome::default();

        // Events are processed in a loop; effects may feed new events back
        let mut pending = VecDeque::from([Event::resume(input)]);
        while let Some(event) = pending.pop_front() {
            let result = transition(&self.graph, &state, &context, event)?;
            if result.is_noop() {
                tracing::debug!(thread_id, position = ?state.position, "Nothing pending");
            }
            state = result.new_state;

            for effect in result.effects {
                if let Some(next) = self
                    .execute_effect(thread_id, &state, effect, events, &mut outcome)
                    .await?
                {
                    pending.push_back(next);
                }
            }
        }

        outcome.position = state.position;
        Ok(outcome)
    }

    async fn execute_effect(
        &self,
        thread_id: &str,
        state: &FlowState,
        effect: Effect,
        events: &broadcast::Sender<FlowEvent>,
        outcome: &mut RunOutcome,
    ) -> Result<Option<Event>, EngineError> {
        match effect {
            Effect::PersistCheckpoint => {
                self.store
                    .save(thread_id, state)
                    .await
                    .map_err(EngineError::Store)?;
                Ok(None)
            }

            Effect::EmitMessage { message } => {
                outcome.messages.push(message.clone());
                let _ = events.send(FlowEvent::Message { message });
                Ok(None)
            }

            Effect::ExecuteStep { step, attempt } => {
                tracing::info!(thread_id, step = %step, attempt, "Executing step");
                let streamed = AtomicBool::new(false);
                let sink = |text: &str| {
                    streamed.store(true, Ordering::Relaxed);
                    let _ = events.send(FlowEvent::Token {
                        text: text.to_string(),
                    });
                };
                match self.steps.execute(step, &state.conversation, &sink).await {
                    Ok(update) => {
                        outcome.executed.push(step);
                        Ok(Some(Event::StepCompleted { step, update }))
                    }
                    Err(e) => {
                        tracing::warn!(
                            thread_id,
                            step = %step,
                            attempt,
                            error = %e,
                            kind = ?e.kind,
                            retryable = e.kind.is_retryable(),
                            "Step failed"
                        );
                        // Tokens from the failed attempt never become a message
                        if streamed.load(Ordering::Relaxed) {
                            let _ = events.send(FlowEvent::StreamReset { step });
                        }
                        Ok(Some(Event::StepFailed {
                            step,
                            attempt,
                            message: e.message,
                            error_kind: e.kind,
                            retry_after: e.retry_after,
                        }))
                    }
                }
            }

            Effect::ScheduleRetry {
                step,
                attempt,
                delay,
            } => {
                let delay = delay + jitter(delay);
                tracing::info!(
                    thread_id,
                    step = %step,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying step after backoff"
                );
                tokio::time::sleep(delay).await;
                Ok(Some(Event::RetryElapsed { step, attempt }))
            }

            Effect::Notify(notification) => {
                let event = match notification {
                    Notification::AwaitingInput { step } => FlowEvent::AwaitingInput { step },
                    Notification::ConversationComplete => FlowEvent::ConversationComplete,
                    Notification::Unavailable { step, message } => {
                        tracing::error!(
                            thread_id,
                            step = %step,
                            error = %message,
                            "Step unavailable after retries"
                        );
                        outcome.notice = Some(UNAVAILABLE_NOTICE.to_string());
                        FlowEvent::Unavailable {
                            step,
                            message: UNAVAILABLE_NOTICE.to_string(),
                        }
                    }
                };
                let _ = events.send(event);
                Ok(None)
            }
        }
    }
}

/// Random extra wait of up to a tenth of `delay`
fn jitter(delay: Duration) -> Duration {
    let max = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
