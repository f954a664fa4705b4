//! Pure state transition function
//!
//! Given the graph, the checkpointed flow state and one event, compute the
//! next flow state and the effects the executor must carry out. No I/O
//! happens here; collaborator work is requested through
//! [`Effect::ExecuteStep`] and its outcome comes back as an event.

use super::effect::Notification;
use super::graph::{FlowGraph, RouteError, Target};
use super::state::{ChatMessage, FlowContext, FlowState, Position, Role};
use super::{Effect, Event};
use std::time::Duration;
use thiserror::Error;

/// Longest provider-requested wait honoured before a retry
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: FlowState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: FlowState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// No state change and nothing to do
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Pure transition function
///
/// Given the same inputs this always produces the same outputs.
pub fn transition(
    graph: &FlowGraph,
    state: &FlowState,
    context: &FlowContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (&state.position, event) {
        // ============================================================
        // Resume
        // ============================================================

        // Fresh thread: fold in the opening message and enter the start step
        (Position::Start, Event::Resume { input }) => {
            let mut next = state.clone();
            if let Some(text) = input {
                next.conversation.messages.push(ChatMessage::user(text));
            }
            let target = Target::Step(graph.start());
            Ok(enter(graph, next, target, vec![]))
        }

        // Reply at an interrupt: satisfy it and advance to its successor
        (Position::AwaitingInput { step }, Event::Resume { input: Some(text) }) => {
            let step = *step;
            let mut next = state.clone();
            next.conversation.messages.push(ChatMessage::user(text.clone()));
            next.conversation.user_feedback = Some(text);
            next.trail.push(step);
            let target = graph.next(step, &next.conversation)?;
            Ok(enter(graph, next, target, vec![]))
        }

        // Nothing pending, or already finished
        (Position::AwaitingInput { .. }, Event::Resume { input: None })
        | (Position::Complete, Event::Resume { .. }) => Ok(TransitionResult::new(state.clone())),

        // Interrupted or failed mid-step: run the recorded step again
        (Position::Running { step } | Position::Failed { step, .. }, Event::Resume { input }) => {
            let step = *step;
            let mut next = state.clone();
            if let Some(text) = input {
                next.conversation.messages.push(ChatMessage::user(text));
            }
            next.position = Position::Running { step };
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PersistCheckpoint)
                .with_effect(Effect::execute(step)))
        }

        // ============================================================
        // Step outcomes
        // ============================================================
        (Position::Running { step }, Event::StepCompleted { step: done, update })
            if *step == done =>
        {
            let mut next = state.clone();
            let emitted: Vec<Effect> = update
                .messages
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .cloned()
                .map(Effect::emit)
                .collect();
            next.conversation.apply(update);
            next.trail.push(done);
            let target = graph.next(done, &next.conversation)?;
            Ok(enter(graph, next, target, emitted))
        }

        (
            Position::Running { step },
            Event::StepFailed {
                step: failed,
                attempt,
                message,
                error_kind,
                retry_after,
            },
        ) if *step == failed => {
            if error_kind.is_retryable() && attempt < context.max_step_attempts {
                let delay = retry_delay(context.retry_base_delay, attempt, retry_after);
                return Ok(
                    TransitionResult::new(state.clone()).with_effect(Effect::ScheduleRetry {
                        step: failed,
                        attempt: attempt + 1,
                        delay,
                    }),
                );
            }

            let mut next = state.clone();
            next.position = Position::Failed {
                step: failed,
                message: message.clone(),
            };
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PersistCheckpoint)
                .with_effect(Effect::Notify(Notification::Unavailable {
                    step: failed,
                    message,
                })))
        }

        (Position::Running { step }, Event::RetryElapsed { step: retry, attempt })
            if *step == retry =>
        {
            Ok(TransitionResult::new(state.clone())
                .with_effect(Effect::ExecuteStep { step: retry, attempt }))
        }

        (position, event) => Err(TransitionError::InvalidTransition(format!(
            "{event:?} while at {position:?}"
        ))),
    }
}

/// Move to `target`, persisting the step boundary.
///
/// Interrupts and the end halt the run; any other step is scheduled for
/// execution.
fn enter(
    graph: &FlowGraph,
    mut state: FlowState,
    target: Target,
    emitted: Vec<Effect>,
) -> TransitionResult {
    let follow_up = match target {
        Target::End => {
            state.position = Position::Complete;
            Effect::complete()
        }
        Target::Step(step) if graph.is_interrupt(step) => {
            state.position = Position::AwaitingInput { step };
            Effect::awaiting_input(step)
        }
        Target::Step(step) => {
            state.position = Position::Running { step };
            Effect::execute(step)
        }
    };
    TransitionResult::new(state)
        .with_effect(Effect::PersistCheckpoint)
        .with_effects(emitted)
        .with_effect(follow_up)
}

fn retry_delay(base: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    // Exponential backoff: base, 2x base, 4x base
    let backoff = base * (1 << attempt.saturating_sub(1).min(8));
    match retry_after {
        Some(requested) => backoff.max(requested.min(MAX_RETRY_AFTER)),
        None => backoff,
    }
}
