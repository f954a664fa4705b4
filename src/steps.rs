//! Step bodies: the collaborator work behind each non-interrupt step
//!
//! A step reads the conversation, talks to its collaborators and returns a
//! partial [`StateUpdate`]. Routing, checkpointing and retries belong to the
//! state machine and executor; nothing here touches the store.

use crate::classifier::{classify_yes_no, extract_email, EmailExtraction, YesNo};
use crate::llm::{LlmRequest, StreamChunk};
use crate::mailer::PROFILE_SUBJECT;
use crate::runtime::{CollaboratorError, Extractor, LlmClient, Mailer, Retriever};
use crate::state_machine::{
    format_docs, ChatMessage, ConversationState, Decision, Document, DocumentUpdate, ErrorKind,
    StateUpdate, StepId,
};
use crate::system_prompt::{overview_prompt, research_prompt, OVERVIEW_QUERY, RESEARCH_QUERY};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

const MORE_DETAILS_REPLY: &str =
    "Great! I will provide you with more detailed information about our company.";
const EMAIL_REQUEST_REPLY: &str =
    "Great! I will send you company profile via email. Can you provide your email address?";
const DECLINED_REPLY: &str =
    "No problem! If you have any other questions or need further assistance, feel free to ask.";
const EMAIL_MISSING_REPLY: &str =
    "I couldn't find an email address in your message. Could you please provide it?";
const HANDOFF_REPLY: &str = "I'm having trouble reading an email address from your replies. \
     I've passed this conversation to a member of our team, who will follow up with you directly.";

/// Callback receiving streamed text fragments as they arrive
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Chunks requested per retrieval
    pub search_k: usize,
    /// Failed email extractions before handing off to a human
    pub max_email_attempts: u32,
    /// Deadline for any single collaborator call
    pub collaborator_timeout: Duration,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            search_k: 3,
            max_email_attempts: 3,
            collaborator_timeout: Duration::from_secs(30),
        }
    }
}

/// Executes steps against injected collaborators
pub struct StepRunner {
    llm: Arc<dyn LlmClient>,
    extractor: Arc<dyn Extractor>,
    retriever: Arc<dyn Retriever>,
    mailer: Arc<dyn Mailer>,
    config: StepConfig,
}

impl StepRunner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        extractor: Arc<dyn Extractor>,
        retriever: Arc<dyn Retriever>,
        mailer: Arc<dyn Mailer>,
        config: StepConfig,
    ) -> Self {
        Self {
            llm,
            extractor,
            retriever,
            mailer,
            config,
        }
    }

    /// Run one step. Errors are collaborator failures the executor may retry.
    pub async fn execute(
        &self,
        step: StepId,
        conversation: &ConversationState,
        on_token: TokenSink<'_>,
    ) -> Result<StateUpdate, CollaboratorError> {
        tracing::debug!(step = %step, "Executing step");
        match step {
            StepId::InitialOverview => {
                let (reply, docs) = self
                    .generate(conversation, OVERVIEW_QUERY, overview_prompt, on_token)
                    .await?;
                Ok(StateUpdate::default()
                    .message(reply)
                    .documents(DocumentUpdate::Chunks(docs))
                    .route(Decision::Initial, StepId::AskUserInterest.as_str()))
            }
            StepId::ConductResearch => {
                let (reply, docs) = self
                    .generate(conversation, RESEARCH_QUERY, research_prompt, on_token)
                    .await?;
                Ok(StateUpdate::default()
                    .message(reply)
                    .documents(DocumentUpdate::Chunks(docs)))
            }
            StepId::CheckUserInterest => Ok(match self.yes_no(conversation).await {
                YesNo::Yes => StateUpdate::default()
                    .message(ChatMessage::assistant(MORE_DETAILS_REPLY))
                    .route(Decision::MoreDetails, StepId::ConductResearch.as_str()),
                YesNo::No => declined(),
            }),
            StepId::CheckEmailProfileInterest => Ok(match self.yes_no(conversation).await {
                YesNo::Yes => StateUpdate::default()
                    .message(ChatMessage::assistant(EMAIL_REQUEST_REPLY))
                    .route(Decision::EmailRequest, StepId::CollectEmail.as_str()),
                YesNo::No => declined(),
            }),
            StepId::ValidateEmail => Ok(self.validate_email(conversation).await),
            StepId::SendCompanyProfile => self.send_company_profile(conversation).await,
            StepId::HumanHandoff => Ok(StateUpdate {
                handed_off: Some(true),
                ..Default::default()
            }
            .message(ChatMessage::assistant(HANDOFF_REPLY))),
            // Suspension points carry no work of their own
            StepId::AskUserInterest | StepId::AskEmailInterest | StepId::CollectEmail => {
                Ok(StateUpdate::default())
            }
        }
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<Document>, CollaboratorError> {
        let timeout = self.config.collaborator_timeout;
        tokio::time::timeout(timeout, self.retriever.search(query, self.config.search_k))
            .await
            .map_err(|_| CollaboratorError::timeout("retrieval", timeout))?
    }

    /// Retrieve, prompt and stream one assistant reply
    async fn generate(
        &self,
        conversation: &ConversationState,
        query: &str,
        prompt: fn(&[Document]) -> String,
        on_token: TokenSink<'_>,
    ) -> Result<(ChatMessage, Vec<Document>), CollaboratorError> {
        let docs = self.retrieve(query).await?;
        let request = LlmRequest::new(prompt(&docs)).with_history(&conversation.messages);

        let timeout = self.config.collaborator_timeout;
        let text = tokio::time::timeout(timeout, self.stream_text(&request, on_token))
            .await
            .map_err(|_| CollaboratorError::timeout("language model", timeout))??;

        if text.trim().is_empty() {
            return Err(CollaboratorError::malformed("Language model returned no text"));
        }
        Ok((ChatMessage::assistant(text), docs))
    }

    async fn stream_text(
        &self,
        request: &LlmRequest,
        on_token: TokenSink<'_>,
    ) -> Result<String, CollaboratorError> {
        let mut stream = self.llm.stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta(fragment) => {
                    on_token(&fragment);
                    text.push_str(&fragment);
                }
                StreamChunk::Done => return Ok(text),
            }
        }
        Err(CollaboratorError::new(
            ErrorKind::Network,
            "Stream ended without completion marker",
        ))
    }

    async fn yes_no(&self, conversation: &ConversationState) -> YesNo {
        let reply = conversation.user_feedback.as_deref().unwrap_or_default();
        classify_yes_no(self.extractor.as_ref(), reply, self.config.collaborator_timeout).await
    }

    async fn validate_email(&self, conversation: &ConversationState) -> StateUpdate {
        let reply = conversation.user_feedback.as_deref().unwrap_or_default();
        match extract_email(self.extractor.as_ref(), reply, self.config.collaborator_timeout).await
        {
            EmailExtraction::Found(email) => StateUpdate {
                collected_email: Some(email.clone()),
                email_attempts: Some(0),
                ..Default::default()
            }
            .message(ChatMessage::assistant(format!(
                "Perfect! Your email address is: {email}. I will send the company profile to this email address."
            )))
            .route(Decision::EmailValidated, StepId::SendCompanyProfile.as_str()),
            EmailExtraction::Absent => {
                let attempts = conversation.email_attempts + 1;
                let update = StateUpdate {
                    email_attempts: Some(attempts),
                    ..Default::default()
                };
                if attempts >= self.config.max_email_attempts {
                    tracing::info!(attempts, "No email after repeated attempts, handing off");
                    update.route(Decision::Handoff, StepId::HumanHandoff.as_str())
                } else {
                    update
                        .message(ChatMessage::assistant(EMAIL_MISSING_REPLY))
                        .route(Decision::CollectEmail, StepId::CollectEmail.as_str())
                }
            }
        }
    }

    /// Delivery failure is reported to the user, never raised
    async fn send_company_profile(
        &self,
        conversation: &ConversationState,
    ) -> Result<StateUpdate, CollaboratorError> {
        let email = conversation.collected_email.as_deref().ok_or_else(|| {
            CollaboratorError::new(ErrorKind::InvalidRequest, "No validated email address")
        })?;
        let body = format_docs(&conversation.retrieved_documents);
        let timeout = self.config.collaborator_timeout;

        let delivery = self.mailer.deliver(email, PROFILE_SUBJECT, &body);
        let delivered = tokio::time::timeout(timeout, delivery)
            .await
            .map_err(|_| CollaboratorError::timeout("email delivery", timeout))
            .and_then(|r| r);

        Ok(match delivered {
            Ok(()) => StateUpdate {
                email_sent: Some(true),
                ..Default::default()
            }
            .message(ChatMessage::assistant(format!(
                "Company profile has been sent to {email}. Is there anything else I can help you with?"
            ))),
            Err(e) => {
                tracing::error!(error = %e, kind = ?e.kind, "Company profile delivery failed");
                StateUpdate {
                    email_sent: Some(false),
                    ..Default::default()
                }
                .message(ChatMessage::assistant(format!(
                    "Sorry, I wasn't able to send the company profile to {email} just now. \
                     Please try again later or contact us directly."
                )))
            }
        })
    }
}

fn declined() -> StateUpdate {
    StateUpdate::default()
        .message(ChatMessage::assistant(DECLINED_REPLY))
        .route(Decision::Overview, "conversation_complete")
}
