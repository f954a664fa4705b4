//! Core conversation flow state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions over
//! a validated step graph. The executor in [`crate::runtime`] performs the
//! effects.

mod effect;
pub mod event;
pub mod graph;
pub mod state;
pub mod step;
pub(crate) mod transition;


pub use effect::{Effect, Notification};
pub use event::{ErrorKind, Event};
pub use graph::{company_profile_flow, FlowGraph, GraphError, RouteError, Target};
pub use state::{
    format_docs, ChatMessage, ConversationState, Document, DocumentUpdate, FlowContext, FlowState,
    Position, Role, StateUpdate, TerminalFlags,
};
pub use step::{Decision, StepId, StepKind};
pub use transition::{transition, TransitionError};
