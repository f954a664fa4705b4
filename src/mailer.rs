//! Outbound email for the company profile

use crate::runtime::{CollaboratorError, Mailer};
use crate::state_machine::ErrorKind;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use reqwest::Client;
use std::fmt::Write as _;
use std::time::Duration;

pub const PROFILE_SUBJECT: &str = "Company Detail Overview";

const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// A plain-text RFC 2822 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl OutgoingMessage {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "From: {}\r\n", self.from);
        let _ = write!(out, "To: {}\r\n", self.to);
        if !self.cc.is_empty() {
            let _ = write!(out, "Cc: {}\r\n", self.cc.join(", "));
        }
        let _ = write!(out, "Subject: {}\r\n", self.subject);
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=\"utf-8\"\r\n");
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// URL-safe base64 of the rendered message, as the Gmail API expects
    pub fn raw(&self) -> String {
        URL_SAFE.encode(self.render())
    }
}

/// Delivery through the Gmail REST API with a pre-issued access token
pub struct GmailMailer {
    client: Client,
    access_token: String,
    sender: String,
    cc: Vec<String>,
    endpoint: String,
}

impl GmailMailer {
    pub fn new(
        access_token: String,
        sender: String,
        cc: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            CollaboratorError::new(ErrorKind::Unknown, format!("Failed to create HTTP client: {e}"))
        })?;
        Ok(Self {
            client,
            access_token,
            sender,
            cc,
            endpoint: GMAIL_SEND_URL.to_string(),
        })
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn message(&self, recipient: &str, subject: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            from: self.sender.clone(),
            to: recipient.to_string(),
            cc: self.cc.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl Mailer for GmailMailer {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        let message = self.message(recipient, subject, body);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "raw": message.raw() }))
            .send()
            .await
            .map_err(|e| CollaboratorError::from_reqwest("Gmail", &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::from_status("Gmail", status.as_u16(), &text));
        }

        tracing::info!(recipient, cc = self.cc.len(), "Company profile sent");
        Ok(())
    }
}

/// Mailer that only logs; used when no Gmail credentials are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(
            recipient,
            subject,
            body_len = body.len(),
            "Email delivery skipped (no mailer configured)"
        );
        Ok(())
    }
}
