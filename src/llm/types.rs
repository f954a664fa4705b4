//! Common types for LLM interactions

use crate::state_machine::{ChatMessage, Role};
use serde_json::Value;

/// LLM request
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Constrain the reply to JSON matching this schema
    pub response_schema: Option<JsonSchema>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            temperature: Some(0.0),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: LlmMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Append conversation history; system turns are folded into the
    /// system prompt by the provider layer, so they are skipped here.
    pub fn with_history(mut self, history: &[ChatMessage]) -> Self {
        self.messages.extend(history.iter().filter_map(LlmMessage::from_chat));
        self
    }

    pub fn with_schema(mut self, schema: JsonSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Message in conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    fn from_chat(message: &ChatMessage) -> Option<Self> {
        match message.role {
            Role::User => Some(Self::user(message.content.clone())),
            Role::Assistant => Some(Self::assistant(message.content.clone())),
            Role::System => None,
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

/// Named JSON schema for structured output
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchema {
    pub name: String,
    pub schema: Value,
}

/// LLM response
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub end_turn: bool,
    pub usage: Usage,
}

/// Usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One item of a streamed completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Next text fragment, in order
    Delta(String),
    /// End of the completion; nothing follows
    Done,
}
