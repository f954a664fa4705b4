//! OpenAI-compatible chat completions and embeddings

use super::{
    CompletionStream, EmbeddingService, LlmError, LlmRequest, LlmResponse, LlmService,
    MessageRole, StreamChunk, Usage,
};
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIService {
    client: Client,
    api_key: String,
    base_url: String,
    model_id: String,
    embedding_model: String,
}

impl OpenAIService {
    pub fn new(
        api_key: String,
        base_url: Option<&str>,
        model_id: impl Into<String>,
        embedding_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model_id: model_id.into(),
            embedding_model: embedding_model.into(),
        })
    }

    fn translate_request(&self, request: &LlmRequest, stream: bool) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
            });
        }
        messages.extend(request.messages.iter().map(|m| OpenAIMessage {
            role: match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            }
            .to_string(),
            content: Some(m.content.clone()),
        }));

        let response_format = request.response_schema.as_ref().map(|s| OpenAIResponseFormat {
            r#type: "json_schema".to_string(),
            json_schema: OpenAIJsonSchema {
                name: s.name.clone(),
                schema: s.schema.clone(),
                strict: true,
            },
        });

        OpenAIRequest {
            model: self.model_id.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
            stream,
        }
    }

    fn normalize_response(resp: OpenAIResponse) -> Result<LlmResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::malformed("No choices in response"))?;

        let text = choice.message.content.unwrap_or_default();
        let end_turn = choice.finish_reason.as_deref() == Some("stop");
        let usage = resp.usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: u64::from(u.prompt_tokens),
            output_tokens: u64::from(u.completion_tokens),
        });

        Ok(LlmResponse {
            text,
            end_turn,
            usage,
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;
        let message = serde_json::from_str::<OpenAIErrorResponse>(&body)
            .map_or(body, |resp| resp.error.message);
        let error = LlmError::from_status(status.as_u16(), &message);
        Err(match retry_after {
            Some(delay) => error.with_retry_after(delay),
            None => error,
        })
    }
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = self.translate_request(request, false);
        let response = self.post("chat/completions", &body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;
        let parsed: OpenAIResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::malformed(format!("Failed to parse response: {e}")))?;
        Self::normalize_response(parsed)
    }

    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        let body = self.translate_request(request, true);
        let response = self.post("chat/completions", &body).await?;
        Ok(completion_stream(
            response.bytes_stream(),
            LlmError::from_reqwest,
        ))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[async_trait]
impl EmbeddingService for OpenAIService {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = OpenAIEmbeddingRequest {
            model: &self.embedding_model,
            input: inputs,
        };
        let response = self.post("embeddings", &body).await?;
        let mut parsed: OpenAIEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::malformed(format!("Failed to parse embeddings: {e}")))?;
        if parsed.data.len() != inputs.len() {
            return Err(LlmError::malformed(format!(
                "Expected {} embeddings, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ============================================================================
// Server-sent event decoding
// ============================================================================

/// Decode a chat completion event stream into [`StreamChunk`]s.
///
/// Ends after [`StreamChunk::Done`] or the first error; a body that closes
/// before `[DONE]` yields a network error.
pub(super) fn completion_stream<S, B, E>(bytes: S, transport_error: fn(&E) -> LlmError) -> CompletionStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut events = Box::pin(bytes.eventsource());
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    let error = match e {
                        EventStreamError::Transport(e) => transport_error(&e),
                        EventStreamError::Utf8(e) => {
                            LlmError::malformed(format!("Stream is not UTF-8: {e}"))
                        }
                        EventStreamError::Parser(e) => {
                            LlmError::malformed(format!("Bad event stream: {e}"))
                        }
                    };
                    let _ = tx.send(Err(error)).await;
                    return;
                }
            };
            // Comment-only blocks carry no payload
            if event.data.is_empty() {
                continue;
            }
            let item = match parse_stream_payload(&event.data) {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let done = item == StreamChunk::Done;
            if tx.send(Ok(item)).await.is_err() || done {
                return;
            }
        }
        let _ = tx
            .send(Err(LlmError::network("Stream ended before completion marker")))
            .await;
    });

    ReceiverStream::new(rx).boxed()
}

/// Interpret one `data:` payload of a chat completion stream
fn parse_stream_payload(payload: &str) -> Result<Option<StreamChunk>, LlmError> {
    if payload == "[DONE]" {
        return Ok(Some(StreamChunk::Done));
    }
    let chunk: OpenAIStreamChunk = serde_json::from_str(payload)
        .map_err(|e| LlmError::malformed(format!("Bad stream chunk: {e}")))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
        .map(StreamChunk::Delta))
}

// ============================================================================
// OpenAI API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAIResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    r#type: String,
    json_schema: OpenAIJsonSchema,
}

#[derive(Debug, Serialize)]
struct OpenAIJsonSchema {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}
