//! LLM provider abstraction
//!
//! Provides a common interface for text generation, streaming, structured
//! output and embeddings against an OpenAI-compatible endpoint.

mod error;
mod openai;
mod types;

#[cfg(test)]
mod proptests;

pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAIService;
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// Ordered stream of completion fragments, ending with [`StreamChunk::Done`]
pub type CompletionStream = BoxStream<'static, Result<StreamChunk, LlmError>>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Make a streaming completion request
    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Text embeddings for semantic search
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = Instant::now();
        let result = self.inner.complete(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    structured = request.response_schema.is_some(),
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        let start = Instant::now();
        let model = self.model_id.clone();
        match self.inner.stream(request).await {
            Ok(stream) => {
                tracing::debug!(model = %model, "LLM stream opened");
                let mut fragments = 0usize;
                Ok(stream
                    .inspect(move |item| match item {
                        Ok(StreamChunk::Delta(_)) => fragments += 1,
                        Ok(StreamChunk::Done) => tracing::info!(
                            model = %model,
                            duration_ms = %start.elapsed().as_millis(),
                            fragments,
                            "LLM stream completed"
                        ),
                        Err(e) => tracing::error!(
                            model = %model,
                            error = %e.message,
                            retryable = e.kind.is_retryable(),
                            "LLM stream failed"
                        ),
                    })
                    .boxed())
            }
            Err(e) => {
                tracing::error!(
                    model = %model,
                    duration_ms = %start.elapsed().as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM stream request failed"
                );
                Err(e)
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
