//! Mock implementations for testing
//!
//! These mocks enable end-to-end flow tests without real I/O.

use super::traits::*;
use super::{FlowEvent, FlowExecutor, RunOutcome, SessionManager};
use crate::classifier::{ExtractionSchema, RuleExtractor};
use crate::llm::{CompletionStream, LlmError, LlmRequest, LlmResponse, StreamChunk, Usage};
use crate::state_machine::{company_profile_flow, Document, FlowState, Position};
use crate::steps::{StepConfig, StepRunner};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const DEFAULT_REPLY: &str = "Acme builds reliable widgets for every workshop.";

// ============================================================================
// Mock LLM Client
// ============================================================================

/// One queued reply of the mock client
enum ScriptedReply {
    Text(String),
    Error(LlmError),
    /// Streams `partial`, then fails with `error` before the end marker
    CutOff { partial: String, error: LlmError },
}

/// Mock LLM client that returns queued replies, then a canned one
pub struct MockLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    hanging: Mutex<bool>,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            hanging: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.push(ScriptedReply::Text(text.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.push(ScriptedReply::Error(error));
    }

    /// Next stream delivers `partial` and then breaks with `error`
    pub fn queue_cut_off(&self, partial: impl Into<String>, error: LlmError) {
        self.push(ScriptedReply::CutOff {
            partial: partial.into(),
            error,
        });
    }

    /// Every later call waits forever
    pub fn hang(&self) {
        *self.hanging.lock().unwrap() = true;
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    async fn next_reply(&self, request: &LlmRequest) -> ScriptedReply {
        self.requests.lock().unwrap().push(request.clone());
        let hanging = *self.hanging.lock().unwrap();
        if hanging {
            std::future::pending::<()>().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Text(DEFAULT_REPLY.to_string()))
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

fn deltas(text: &str) -> Vec<Result<StreamChunk, LlmError>> {
    text.split_inclusive(' ')
        .map(|word| Ok(StreamChunk::Delta(word.to_string())))
        .collect()
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match self.next_reply(request).await {
            ScriptedReply::Text(text) => Ok(LlmResponse {
                text,
                end_turn: true,
                usage: Usage::default(),
            }),
            ScriptedReply::Error(error) | ScriptedReply::CutOff { error, .. } => Err(error),
        }
    }

    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        let chunks = match self.next_reply(request).await {
            ScriptedReply::Text(text) => {
                let mut chunks = deltas(&text);
                chunks.push(Ok(StreamChunk::Done));
                chunks
            }
            ScriptedReply::Error(error) => return Err(error),
            ScriptedReply::CutOff { partial, error } => {
                let mut chunks = deltas(&partial);
                chunks.push(Err(error));
                chunks
            }
        };
        Ok(futures::stream::iter(chunks).boxed())
    }
}

// ============================================================================
// Scripted Extractor
// ============================================================================

/// Extractor returning queued values; with an empty queue it applies the
/// keyword rules
pub struct ScriptedExtractor {
    outputs: Mutex<VecDeque<Result<Value, CollaboratorError>>>,
    hanging: bool,
    pub calls: Mutex<Vec<(String, ExtractionSchema)>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(VecDeque::new()),
            hanging: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    pub fn queue(&self, value: Value) {
        self.outputs.lock().unwrap().push_back(Ok(value));
    }

    pub fn queue_error(&self, error: CollaboratorError) {
        self.outputs.lock().unwrap().push_back(Err(error));
    }
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        text: &str,
        schema: &ExtractionSchema,
    ) -> Result<Value, CollaboratorError> {
        self.calls.lock().unwrap().push((text.to_string(), *schema));
        if self.hanging {
            std::future::pending::<()>().await;
        }
        let scripted = self.outputs.lock().unwrap().pop_front();
        match scripted {
            Some(output) => output,
            None => RuleExtractor.extract(text, schema).await,
        }
    }
}

// ============================================================================
// Mock Retriever
// ============================================================================

pub struct MockRetriever {
    docs: Vec<Document>,
    queries: Mutex<Vec<(String, usize)>>,
}

impl MockRetriever {
    pub fn with_docs(docs: Vec<Document>) -> Self {
        Self {
            docs,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(String, usize)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, CollaboratorError> {
        self.queries.lock().unwrap().push((query.to_string(), k));
        Ok(self.docs.iter().take(k).cloned().collect())
    }
}

// ============================================================================
// Mock Mailer
// ============================================================================

pub struct MockMailer {
    fail: bool,
    sent: Mutex<Vec<(String, String, String)>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self {
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every delivery fails with a non-retryable error
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Delivered `(recipient, subject, body)` triples
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for MockMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        if self.fail {
            return Err(CollaboratorError::new(
                crate::state_machine::ErrorKind::Auth,
                "mailbox rejected credentials",
            ));
        }
        self.sent.lock().unwrap().push((
            recipient.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Checkpoint store keeping every checkpoint per thread
#[derive(Default)]
pub struct InMemoryStore {
    threads: Mutex<HashMap<String, Vec<FlowState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self, thread_id: &str) -> Vec<FlowState> {
        self.threads
            .lock()
            .unwrap()
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn create(&self, thread_id: &str) -> Result<(), String> {
        self.threads
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_default();
        Ok(())
    }

    async fn exists(&self, thread_id: &str) -> Result<bool, String> {
        Ok(self.threads.lock().unwrap().contains_key(thread_id))
    }

    async fn load(&self, thread_id: &str) -> Result<Option<FlowState>, String> {
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(thread_id)
            .and_then(|cps| cps.last().cloned()))
    }

    async fn save(&self, thread_id: &str, state: &FlowState) -> Result<(), String> {
        self.threads
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_default()
            .push(state.clone());
        Ok(())
    }

    async fn reset(&self, thread_id: &str) -> Result<(), String> {
        match self.threads.lock().unwrap().get_mut(thread_id) {
            Some(cps) => {
                cps.clear();
                Ok(())
            }
            None => Err(format!("Thread not found: {thread_id}")),
        }
    }
}

// ============================================================================
// Test Engine
// ============================================================================

/// Full engine wired to mocks
pub struct TestEngine {
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<MockLlmClient>,
    pub extractor: Arc<ScriptedExtractor>,
    pub retriever: Arc<MockRetriever>,
    pub mailer: Arc<MockMailer>,
    pub sessions: SessionManager<Arc<InMemoryStore>>,
}

pub struct TestEngineBuilder {
    mailer: MockMailer,
    config: StepConfig,
    max_step_attempts: u32,
}

impl TestEngine {
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder {
            mailer: MockMailer::new(),
            config: StepConfig::default(),
            max_step_attempts: 2,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn start(&self) -> String {
        self.sessions.create_session().await.unwrap()
    }

    pub async fn turn(&self, thread_id: &str, input: Option<&str>) -> RunOutcome {
        self.sessions
            .send(thread_id, input.map(str::to_string))
            .await
            .unwrap()
    }

    pub async fn state(&self, thread_id: &str) -> FlowState {
        self.sessions.state(thread_id).await.unwrap()
    }
}

impl TestEngineBuilder {
    pub fn mailer(mut self, mailer: MockMailer) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn step_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_step_attempts(mut self, attempts: u32) -> Self {
        self.max_step_attempts = attempts;
        self
    }

    pub fn build(self) -> TestEngine {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::new());
        let extractor = Arc::new(ScriptedExtractor::new());
        let retriever = Arc::new(MockRetriever::with_docs(vec![
            Document::new("Acme builds widgets.").with_metadata("source", "about.md"),
            Document::new("Acme was founded in 2010.").with_metadata("source", "history.md"),
        ]));
        let mailer = Arc::new(self.mailer);

        let steps = StepRunner::new(
            llm.clone(),
            extractor.clone(),
            retriever.clone(),
            mailer.clone(),
            self.config,
        );
        let graph = company_profile_flow().unwrap();
        let executor = FlowExecutor::new(graph, store.clone(), steps)
            .with_retry_policy(self.max_step_attempts, Duration::ZERO);

        TestEngine {
            store,
            llm,
            extractor,
            retriever,
            mailer,
            sessions: SessionManager::new(executor),
        }
    }
}

/// Everything currently buffered on a subscription
pub fn drain(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn awaiting(step: crate::state_machine::StepId) -> Position {
    Position::AwaitingInput { step }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EngineError;
    use crate::state_machine::{ErrorKind, Role, StepId};

    #[tokio::test]
    async fn test_first_turn_halts_at_user_interest() {
        let engine = TestEngine::new();
        let id = engine.start().await;

        let outcome = engine.turn(&id, Some("Hi")).await;

        assert_eq!(outcome.position, awaiting(StepId::AskUserInterest));
        assert_eq!(outcome.executed, vec![StepId::InitialOverview]);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].content, DEFAULT_REPLY);

        let state = engine.state(&id).await;
        assert_eq!(state.conversation.messages[0].role, Role::User);
        assert_eq!(state.conversation.retrieved_documents.len(), 2);
    }

    #[tokio::test]
    async fn test_tell_me_more_halts_at_email_interest() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;

        let outcome = engine.turn(&id, Some("tell me more")).await;

        assert_eq!(
            outcome.executed,
            vec![StepId::CheckUserInterest, StepId::ConductResearch]
        );
        assert!(!outcome.messages.is_empty());
        assert_eq!(
            engine.sessions.status(&id).await.unwrap().next_step(),
            Some(StepId::AskEmailInterest)
        );
    }

    #[tokio::test]
    async fn test_second_run_without_input_is_noop() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;
        let saved = engine.store.checkpoints(&id).len();
        let requests = engine.llm.recorded_requests().len();

        let outcome = engine.turn(&id, None).await;

        assert!(outcome.messages.is_empty());
        assert!(outcome.executed.is_empty());
        assert_eq!(outcome.position, awaiting(StepId::AskUserInterest));
        assert_eq!(engine.store.checkpoints(&id).len(), saved);
        assert_eq!(engine.llm.recorded_requests().len(), requests);
    }

    #[tokio::test]
    async fn test_no_interest_ends_without_research() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;

        let outcome = engine.turn(&id, Some("no thanks")).await;
        assert_eq!(outcome.position, Position::Complete);

        // Input after completion changes nothing
        let after = engine.turn(&id, Some("hello?")).await;
        assert!(after.messages.is_empty());

        let state = engine.state(&id).await;
        for step in [
            StepId::ConductResearch,
            StepId::CollectEmail,
            StepId::SendCompanyProfile,
        ] {
            assert!(!state.visited(step), "{step} should not run");
        }
        assert!(engine.mailer.sent().is_empty());
        assert_eq!(state.conversation.messages.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_email_loop_then_delivery() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;
        engine.turn(&id, Some("yes")).await;

        let asked = engine.turn(&id, Some("yes please")).await;
        assert_eq!(asked.position, awaiting(StepId::CollectEmail));

        let missing = engine.turn(&id, Some("I don't have one")).await;
        assert_eq!(missing.position, awaiting(StepId::CollectEmail));
        assert_eq!(engine.state(&id).await.conversation.email_attempts, 1);

        let done = engine.turn(&id, Some("my email is x@y.com")).await;
        assert_eq!(done.position, Position::Complete);
        assert_eq!(
            done.executed,
            vec![StepId::ValidateEmail, StepId::SendCompanyProfile]
        );

        let sent = engine.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "x@y.com");
        assert!(sent[0].2.starts_with("<documents>"));

        let state = engine.state(&id).await;
        assert_eq!(state.conversation.collected_email.as_deref(), Some("x@y.com"));
        assert_eq!(state.conversation.email_attempts, 0);
        assert!(state.conversation.terminal_flags.email_sent);
    }

    #[tokio::test]
    async fn test_repeated_missing_email_hands_off() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        for reply in ["Hi", "yes", "yes", "no idea", "nope"] {
            engine.turn(&id, Some(reply)).await;
        }

        let outcome = engine.turn(&id, Some("still nothing")).await;

        assert_eq!(outcome.position, Position::Complete);
        assert_eq!(
            outcome.executed,
            vec![StepId::ValidateEmail, StepId::HumanHandoff]
        );
        let state = engine.state(&id).await;
        assert!(state.conversation.terminal_flags.handed_off);
        assert!(!state.conversation.terminal_flags.email_sent);
        assert!(engine.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_apologizes_and_completes() {
        let engine = TestEngine::builder().mailer(MockMailer::failing()).build();
        let id = engine.start().await;
        for reply in ["Hi", "yes", "yes"] {
            engine.turn(&id, Some(reply)).await;
        }

        let outcome = engine.turn(&id, Some("x@y.com")).await;

        assert_eq!(outcome.position, Position::Complete);
        assert!(outcome.messages.last().unwrap().content.starts_with("Sorry"));
        assert!(!engine.state(&id).await.conversation.terminal_flags.email_sent);
    }

    #[tokio::test]
    async fn test_threads_run_independently() {
        let engine = TestEngine::new();
        let t1 = engine.start().await;
        let t2 = engine.start().await;
        engine.turn(&t1, Some("Hi")).await;
        engine.turn(&t2, Some("Hello")).await;

        let (a, b) = tokio::join!(
            engine.turn(&t1, Some("tell me more")),
            engine.turn(&t2, Some("no"))
        );

        assert_eq!(a.position, awaiting(StepId::AskEmailInterest));
        assert_eq!(b.position, Position::Complete);
        assert_eq!(engine.state(&t1).await.conversation.messages[0].content, "Hi");
        assert_eq!(engine.state(&t2).await.conversation.messages[0].content, "Hello");
    }

    #[tokio::test]
    async fn test_concurrent_runs_on_one_thread_serialize() {
        let engine = TestEngine::new();
        let id = engine.start().await;

        let (a, b) = tokio::join!(engine.turn(&id, None), engine.turn(&id, None));

        // Exactly one of the two runs did the work
        assert_eq!(a.executed.len() + b.executed.len(), 1);
        assert_eq!(engine.llm.recorded_requests().len(), 1);
        assert_eq!(a.position, b.position);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.llm.queue_error(LlmError::server_error("overloaded"));

        let outcome = engine.turn(&id, Some("Hi")).await;

        assert_eq!(outcome.position, awaiting(StepId::AskUserInterest));
        assert_eq!(engine.llm.recorded_requests().len(), 2);
        assert!(outcome.notice.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        let mut rx = engine.sessions.subscribe(&id).await.unwrap();
        engine.llm.queue_error(LlmError::server_error("overloaded"));
        engine.llm.queue_error(LlmError::network("connection reset"));

        let outcome = engine.turn(&id, Some("Hi")).await;

        assert!(matches!(
            outcome.position,
            Position::Failed { step: StepId::InitialOverview, .. }
        ));
        assert!(outcome.notice.is_some());
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, FlowEvent::Unavailable { step: StepId::InitialOverview, .. })));
        assert_eq!(
            events.last(),
            Some(&FlowEvent::TurnEnd {
                next_step: Some(StepId::InitialOverview)
            })
        );

        // The conversation holds only the user's message
        let state = engine.state(&id).await;
        assert_eq!(state.conversation.messages.len(), 1);

        // Next call re-executes the failed step
        let recovered = engine.turn(&id, None).await;
        assert_eq!(recovered.position, awaiting(StepId::AskUserInterest));
        assert_eq!(engine.state(&id).await.conversation.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.llm.queue_error(LlmError::auth("bad key"));

        let outcome = engine.turn(&id, Some("Hi")).await;

        assert!(matches!(outcome.position, Position::Failed { .. }));
        assert_eq!(engine.llm.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_hanging_model_times_out() {
        let engine = TestEngine::builder()
            .step_config(StepConfig {
                collaborator_timeout: Duration::from_millis(20),
                ..StepConfig::default()
            })
            .build();
        let id = engine.start().await;
        engine.llm.hang();

        let outcome = engine.turn(&id, Some("Hi")).await;

        assert!(matches!(outcome.position, Position::Failed { .. }));
        assert_eq!(engine.llm.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_extractor_failure_defaults_to_no() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;
        engine
            .extractor
            .queue_error(CollaboratorError::new(ErrorKind::Timeout, "slow"));

        let outcome = engine.turn(&id, Some("yes!")).await;

        assert_eq!(outcome.position, Position::Complete);
        assert!(!engine.state(&id).await.visited(StepId::ConductResearch));
    }

    #[tokio::test]
    async fn test_events_stream_in_order() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        let mut rx = engine.sessions.subscribe(&id).await.unwrap();

        engine.turn(&id, Some("Hi")).await;

        let events = drain(&mut rx);
        let tokens: String = events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, DEFAULT_REPLY);

        let tail: Vec<&FlowEvent> = events
            .iter()
            .filter(|e| !matches!(e, FlowEvent::Token { .. }))
            .collect();
        assert!(matches!(tail[0], FlowEvent::Message { .. }));
        assert_eq!(
            tail[1],
            &FlowEvent::AwaitingInput {
                step: StepId::AskUserInterest
            }
        );
        assert_eq!(
            tail[2],
            &FlowEvent::TurnEnd {
                next_step: Some(StepId::AskUserInterest)
            }
        );
    }

    #[tokio::test]
    async fn test_retried_step_discards_partial_tokens() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        let mut rx = engine.sessions.subscribe(&id).await.unwrap();
        engine
            .llm
            .queue_cut_off("Welcome ", LlmError::network("connection reset"));
        engine.llm.queue_text("Welcome to Acme.");

        let outcome = engine.turn(&id, Some("Hi")).await;
        assert_eq!(outcome.messages[0].content, "Welcome to Acme.");

        let events = drain(&mut rx);
        let resets: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                matches!(e, FlowEvent::StreamReset { step: StepId::InitialOverview })
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(resets.len(), 1);

        // Replaying the stream from the last reset yields the stored message
        let replayed: String = events[resets[0]..]
            .iter()
            .take_while(|e| !matches!(e, FlowEvent::Message { .. }))
            .filter_map(|e| match e {
                FlowEvent::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, outcome.messages[0].content);
    }

    #[tokio::test]
    async fn test_rate_limit_waits_for_requested_delay() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.llm.queue_error(
            LlmError::rate_limit("slow down").with_retry_after(Duration::from_millis(50)),
        );

        let started = std::time::Instant::now();
        let outcome = engine.turn(&id, Some("Hi")).await;

        assert_eq!(outcome.position, awaiting(StepId::AskUserInterest));
        assert_eq!(engine.llm.recorded_requests().len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unknown_threads_leave_no_trace() {
        let engine = TestEngine::new();
        for n in 0..50 {
            let id = format!("made-up-{n}");
            assert!(engine.sessions.send(&id, Some("Hi".to_string())).await.is_err());
            assert!(engine.sessions.subscribe(&id).await.is_err());
            assert!(engine.sessions.reset(&id).await.is_err());
        }
        assert_eq!(engine.sessions.open_channels().await, 0);
        assert_eq!(engine.sessions.tracked_locks(), 0);

        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;
        assert_eq!(engine.sessions.open_channels().await, 1);
        assert_eq!(engine.sessions.tracked_locks(), 1);
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let engine = TestEngine::new();
        let id = engine.start().await;
        engine.turn(&id, Some("Hi")).await;
        engine.turn(&id, Some("no")).await;

        engine.sessions.reset(&id).await.unwrap();
        assert_eq!(engine.sessions.status(&id).await.unwrap(), Position::Start);
        assert!(engine.store.checkpoints(&id).is_empty());

        let outcome = engine.turn(&id, Some("Hi again")).await;
        assert_eq!(outcome.position, awaiting(StepId::AskUserInterest));
        let state = engine.state(&id).await;
        assert_eq!(state.conversation.messages[0].content, "Hi again");
        assert_eq!(state.trail, vec![StepId::InitialOverview]);
    }

    #[tokio::test]
    async fn test_unknown_thread() {
        let engine = TestEngine::new();
        let err = engine
            .sessions
            .send("missing", Some("Hi".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ThreadNotFound(_)));
        assert!(matches!(
            engine.sessions.reset("missing").await,
            Err(EngineError::ThreadNotFound(_))
        ));
    }
}
