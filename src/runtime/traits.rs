//! Trait abstractions for runtime I/O
//!
//! Every collaborator the flow touches sits behind one of these traits and
//! is handed to the executor at construction, so tests can substitute
//! fakes.

use crate::classifier::ExtractionSchema;
use crate::llm::{CompletionStream, LlmError, LlmRequest, LlmResponse};
use crate::state_machine::{Document, ErrorKind, FlowState};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of an external collaborator call
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub kind: ErrorKind,
    pub message: String,
    /// Wait requested by the collaborator before trying again
    pub retry_after: Option<Duration>,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{what} timed out after {}ms", after.as_millis()),
        )
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedOutput, message)
    }

    /// Classify a non-success HTTP response from `service`
    pub fn from_status(service: &str, status: u16, message: &str) -> Self {
        Self::new(
            ErrorKind::from_http_status(status),
            format!("{service} returned HTTP {status}: {message}"),
        )
    }

    /// Classify a transport-level HTTP failure talking to `service`
    pub fn from_reqwest(service: &str, e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ErrorKind::Timeout
        } else if e.is_decode() {
            ErrorKind::MalformedOutput
        } else {
            ErrorKind::Network
        };
        Self::new(kind, format!("{service} request failed: {e}"))
    }
}

impl From<LlmError> for CollaboratorError {
    fn from(e: LlmError) -> Self {
        Self {
            kind: e.kind.into(),
            message: e.message,
            retry_after: e.retry_after,
        }
    }
}

/// Durable checkpoint storage keyed by thread id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Register a thread with no checkpoint
    async fn create(&self, thread_id: &str) -> Result<(), String>;

    /// Whether the thread has been registered
    async fn exists(&self, thread_id: &str) -> Result<bool, String>;

    /// Latest checkpoint, or `None` for a thread that has never run
    async fn load(&self, thread_id: &str) -> Result<Option<FlowState>, String>;

    /// Persist a checkpoint at a step boundary
    async fn save(&self, thread_id: &str, state: &FlowState) -> Result<(), String>;

    /// Discard all checkpoints for the thread
    async fn reset(&self, thread_id: &str) -> Result<(), String>;
}

/// Language-model text generation
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Stream fragments in order, ending with an explicit end marker
    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError>;
}

/// Structured extraction constrained to a small schema
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Returns a value conforming to `schema`; anything else is an error
    async fn extract(&self, text: &str, schema: &ExtractionSchema)
        -> Result<Value, CollaboratorError>;
}

/// Semantic search over the company knowledge base
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` chunks, best match first
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, CollaboratorError>;
}

/// Outbound email delivery
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn create(&self, thread_id: &str) -> Result<(), String> {
        (**self).create(thread_id).await
    }

    async fn exists(&self, thread_id: &str) -> Result<bool, String> {
        (**self).exists(thread_id).await
    }

    async fn load(&self, thread_id: &str) -> Result<Option<FlowState>, String> {
        (**self).load(thread_id).await
    }

    async fn save(&self, thread_id: &str, state: &FlowState) -> Result<(), String> {
        (**self).save(thread_id, state).await
    }

    async fn reset(&self, thread_id: &str) -> Result<(), String> {
        (**self).reset(thread_id).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use crate::db::{Database, DbError};
use crate::llm::LlmService;

/// Adapter to use Database as a checkpoint store
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn create(&self, thread_id: &str) -> Result<(), String> {
        self.db
            .create_thread(thread_id)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn exists(&self, thread_id: &str) -> Result<bool, String> {
        match self.db.get_thread(thread_id) {
            Ok(_) => Ok(true),
            Err(DbError::ThreadNotFound(_)) => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn load(&self, thread_id: &str) -> Result<Option<FlowState>, String> {
        self.db
            .latest_checkpoint(thread_id)
            .map(|cp| cp.map(|cp| cp.state))
            .map_err(|e| e.to_string())
    }

    async fn save(&self, thread_id: &str, state: &FlowState) -> Result<(), String> {
        self.db
            .save_checkpoint(thread_id, state)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn reset(&self, thread_id: &str) -> Result<(), String> {
        self.db.reset_thread(thread_id).map_err(|e| e.to_string())
    }
}

/// Adapter to use an [`LlmService`] as the engine's language model
pub struct ServiceLlmClient {
    service: Arc<dyn LlmService>,
}

impl ServiceLlmClient {
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl LlmClient for ServiceLlmClient {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.service.complete(request).await
    }

    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        self.service.stream(request).await
    }
}

/// Stand-in when no model is configured; every call fails without retry
pub struct OfflineLlmClient;

#[async_trait]
impl LlmClient for OfflineLlmClient {
    async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Err(LlmError::auth("No language model configured"))
    }

    async fn stream(&self, _request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        Err(LlmError::auth("No language model configured"))
    }
}
