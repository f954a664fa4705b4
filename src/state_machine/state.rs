//! Conversation state types

use super::step::{Decision, StepId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

// ============================================================================
// Messages
// ============================================================================

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One turn in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Routing decision written by the step that most recently ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub decision: Decision,
    /// Free-form hint describing why the decision was made
    pub logic: String,
}

impl Router {
    pub fn new(decision: Decision, logic: impl Into<String>) -> Self {
        Self {
            decision,
            logic: logic.into(),
        }
    }
}

// ============================================================================
// Retrieved documents
// ============================================================================

/// A retrieved content chunk, identified by a hash of its text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub fingerprint: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            fingerprint: fingerprint(&content),
            content,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Stable content fingerprint: lowercase hex SHA-256 of the text
pub fn fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Update applied to `retrieved_documents`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentUpdate {
    /// Clear the list
    Delete,
    /// Wrap a bare string into one new chunk
    Text(String),
    /// Append chunks whose fingerprint is not yet present
    Chunks(Vec<Document>),
}

/// Merge an update into an existing document list.
///
/// Order is preserved; a chunk is appended only if its fingerprint is absent
/// from both the existing list and the earlier part of the incoming batch.
pub fn merge_documents(existing: &[Document], update: DocumentUpdate) -> Vec<Document> {
    let incoming = match update {
        DocumentUpdate::Delete => return Vec::new(),
        DocumentUpdate::Text(text) => vec![Document::new(text)],
        DocumentUpdate::Chunks(chunks) => chunks,
    };

    let mut seen: HashSet<String> = existing.iter().map(|d| d.fingerprint.clone()).collect();
    let mut merged = existing.to_vec();
    for doc in incoming {
        if seen.insert(doc.fingerprint.clone()) {
            merged.push(doc);
        }
    }
    merged
}

/// Render documents as an XML block for prompts and profile bodies
pub fn format_docs(docs: &[Document]) -> String {
    let mut out = String::from("<documents>");
    for doc in docs {
        out.push_str("\n<document");
        for (key, value) in &doc.metadata {
            let _ = write!(out, " {key}='{}'", value.replace('\'', "&apos;"));
        }
        let _ = write!(out, ">\n{}\n</document>", doc.content);
    }
    if !docs.is_empty() {
        out.push('\n');
    }
    out.push_str("</documents>");
    out
}

// ============================================================================
// Conversation state
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalFlags {
    pub email_sent: bool,
    pub handed_off: bool,
}

/// The evolving conversation record for one thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    /// Most recent raw reply received at an interrupt
    pub user_feedback: Option<String>,
    pub router: Option<Router>,
    pub retrieved_documents: Vec<Document>,
    pub collected_email: Option<String>,
    /// Consecutive failed email extractions
    #[serde(default)]
    pub email_attempts: u32,
    #[serde(default)]
    pub terminal_flags: TerminalFlags,
}

impl ConversationState {
    pub fn decision(&self) -> Option<Decision> {
        self.router.as_ref().map(|r| r.decision)
    }

    /// Fold a step's partial update into the state.
    ///
    /// Messages are appended; the router is replaced (a step that writes no
    /// decision clears it).
    pub fn apply(&mut self, update: StateUpdate) {
        self.messages.extend(update.messages);
        self.router = update.router;
        if let Some(docs) = update.documents {
            self.retrieved_documents = merge_documents(&self.retrieved_documents, docs);
        }
        if let Some(email) = update.collected_email {
            self.collected_email = Some(email);
        }
        if let Some(attempts) = update.email_attempts {
            self.email_attempts = attempts;
        }
        if let Some(sent) = update.email_sent {
            self.terminal_flags.email_sent = sent;
        }
        if let Some(handed_off) = update.handed_off {
            self.terminal_flags.handed_off = handed_off;
        }
    }
}

/// Partial state produced by one step execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    pub messages: Vec<ChatMessage>,
    pub router: Option<Router>,
    pub documents: Option<DocumentUpdate>,
    pub collected_email: Option<String>,
    pub email_attempts: Option<u32>,
    pub email_sent: Option<bool>,
    pub handed_off: Option<bool>,
}

impl StateUpdate {
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn route(mut self, decision: Decision, logic: impl Into<String>) -> Self {
        self.router = Some(Router::new(decision, logic));
        self
    }

    pub fn documents(mut self, update: DocumentUpdate) -> Self {
        self.documents = Some(update);
        self
    }
}

// ============================================================================
// Flow position
// ============================================================================

/// Where the flow is; the persisted "next step" pointer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Position {
    /// Nothing has run yet
    #[default]
    Start,
    /// `step` is next to execute; a crash or timeout here resumes by re-running it
    Running { step: StepId },
    /// Halted before interrupt `step`, waiting for user input
    AwaitingInput { step: StepId },
    /// `step` failed after retries; the next `run` re-executes it
    Failed { step: StepId, message: String },
    /// No next step
    Complete,
}

impl Position {
    /// Step the checkpoint says runs next, if any
    pub fn next_step(&self) -> Option<StepId> {
        match self {
            Position::Running { step }
            | Position::AwaitingInput { step }
            | Position::Failed { step, .. } => Some(*step),
            Position::Start | Position::Complete => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, Position::AwaitingInput { .. } | Position::Complete)
    }
}

/// Complete checkpointed flow state for one thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub position: Position,
    pub conversation: ConversationState,
    /// Steps executed or satisfied, in order
    #[serde(default)]
    pub trail: Vec<StepId>,
}

impl FlowState {
    pub fn visited(&self, step: StepId) -> bool {
        self.trail.contains(&step)
    }
}

/// Per-run context handed to the transition function
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub thread_id: String,
    /// Attempts per step before surfacing "unavailable"
    pub max_step_attempts: u32,
    pub retry_base_delay: Duration,
}

impl FlowContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            max_step_attempts: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}
