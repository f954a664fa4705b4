//! Classifier steps: free text in, one of a few symbolic values out
//!
//! The extraction collaborator is asked for JSON matching a tiny schema.
//! Whatever comes back is validated here; a call that fails, times out or
//! returns something off-schema falls back to the schema's default so an
//! ambiguous value never reaches the router.

use crate::llm::{JsonSchema, LlmMessage, LlmRequest};
use crate::runtime::{CollaboratorError, Extractor, LlmClient};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}")
        .expect("email pattern is valid")
});

const NEGATIVE_WORDS: &[&str] = &[
    "no", "nope", "nah", "not", "don't", "dont", "never", "later", "pass", "stop",
];

const POSITIVE_WORDS: &[&str] = &[
    "yes",
    "yeah",
    "yep",
    "yup",
    "sure",
    "ok",
    "okay",
    "please",
    "more",
    "interested",
    "definitely",
    "absolutely",
    "go",
    "tell",
    "send",
];

// ============================================================================
// Schemas
// ============================================================================

/// The small enumerated output shapes a classifier may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSchema {
    /// `{"answer": "yes" | "no"}`
    YesNo,
    /// `{"email_address": "<address>" | null}`
    Email,
}

impl ExtractionSchema {
    pub fn name(self) -> &'static str {
        match self {
            ExtractionSchema::YesNo => "yes_no",
            ExtractionSchema::Email => "email_extraction",
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            ExtractionSchema::YesNo => "answer",
            ExtractionSchema::Email => "email_address",
        }
    }

    pub fn json_schema(self) -> JsonSchema {
        let property = match self {
            ExtractionSchema::YesNo => json!({
                "type": "string",
                "enum": ["yes", "no"],
                "description": "Whether the user agreed",
            }),
            ExtractionSchema::Email => json!({
                "type": "string",
                "description": "The user's email address, or 'None' if they gave none",
            }),
        };
        let mut properties = serde_json::Map::new();
        properties.insert(self.field().to_string(), property);
        JsonSchema {
            name: self.name().to_string(),
            schema: json!({
                "type": "object",
                "properties": properties,
                "required": [self.field()],
                "additionalProperties": false,
            }),
        }
    }

    /// Reject anything off-schema and normalize what remains.
    ///
    /// Email values failing the address check become `null`.
    pub fn validate(self, value: &Value) -> Result<Value, CollaboratorError> {
        let field = value.get(self.field()).ok_or_else(|| {
            CollaboratorError::malformed(format!("{} output lacks `{}`", self.name(), self.field()))
        })?;

        match self {
            ExtractionSchema::YesNo => {
                let answer = field
                    .as_str()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| s == "yes" || s == "no")
                    .ok_or_else(|| {
                        CollaboratorError::malformed(format!("yes_no answer was {field}"))
                    })?;
                Ok(json!({ "answer": answer }))
            }
            ExtractionSchema::Email => match field {
                Value::Null => Ok(json!({ "email_address": null })),
                Value::String(s) => Ok(json!({ "email_address": normalize_email(s) })),
                other => Err(CollaboratorError::malformed(format!(
                    "email_address was {other}"
                ))),
            },
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            ExtractionSchema::YesNo => {
                "You are a virtual assistant helping a user learn about a company. \
                 Decide whether the user's reply agrees to the question they were \
                 just asked. Answer 'yes' or 'no'."
            }
            ExtractionSchema::Email => {
                "You are a virtual assistant helping a user provide their email \
                 address. Extract the email address from the user's reply. If the \
                 user did not provide one, or it does not look like a common email \
                 format, output 'None'."
            }
        }
    }
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    Yes,
    No,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailExtraction {
    Found(String),
    Absent,
}

/// Classify a reply as yes/no; anything uncertain is `No`
pub async fn classify_yes_no(extractor: &dyn Extractor, text: &str, timeout: Duration) -> YesNo {
    let schema = ExtractionSchema::YesNo;
    match extract_bounded(extractor, text, schema, timeout).await {
        Ok(value) if value["answer"] == "yes" => YesNo::Yes,
        Ok(_) => YesNo::No,
        Err(e) => {
            tracing::warn!(error = %e, kind = ?e.kind, "yes/no classification failed, defaulting to no");
            YesNo::No
        }
    }
}

/// Extract an email address; anything uncertain is `Absent`
pub async fn extract_email(
    extractor: &dyn Extractor,
    text: &str,
    timeout: Duration,
) -> EmailExtraction {
    let schema = ExtractionSchema::Email;
    match extract_bounded(extractor, text, schema, timeout).await {
        Ok(value) => value["email_address"]
            .as_str()
            .and_then(normalize_email)
            .map_or(EmailExtraction::Absent, EmailExtraction::Found),
        Err(e) => {
            tracing::warn!(error = %e, kind = ?e.kind, "email extraction failed, treating as absent");
            EmailExtraction::Absent
        }
    }
}

async fn extract_bounded(
    extractor: &dyn Extractor,
    text: &str,
    schema: ExtractionSchema,
    timeout: Duration,
) -> Result<Value, CollaboratorError> {
    let value = tokio::time::timeout(timeout, extractor.extract(text, &schema))
        .await
        .map_err(|_| CollaboratorError::timeout("extraction", timeout))??;
    // Extractor output is untrusted
    schema.validate(&value)
}

/// Return the address if `candidate` is a syntactically valid email
pub fn normalize_email(candidate: &str) -> Option<String> {
    let trimmed = candidate
        .trim()
        .trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '"' | '\'' | ',' | ';' | '.'));
    if trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    EMAIL_REGEX
        .find(trimmed)
        .filter(|m| m.start() == 0 && m.end() == trimmed.len())
        .map(|m| m.as_str().to_string())
}

/// First email-looking token in free text
pub fn find_email(text: &str) -> Option<String> {
    EMAIL_REGEX
        .find_iter(text)
        .find_map(|m| normalize_email(m.as_str()))
}

// ============================================================================
// Extractors
// ============================================================================

/// Extraction through the language model's structured output mode
pub struct LlmExtractor {
    llm: Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        text: &str,
        schema: &ExtractionSchema,
    ) -> Result<Value, CollaboratorError> {
        let request = LlmRequest::new(schema.instructions())
            .with_message(LlmMessage::user(format!("User's response: {text}")))
            .with_schema(schema.json_schema());
        let response = self.llm.generate(&request).await?;
        let value: Value = serde_json::from_str(response.text.trim()).map_err(|e| {
            CollaboratorError::malformed(format!("{} output is not JSON: {e}", schema.name()))
        })?;
        schema.validate(&value)
    }
}

/// Keyword and pattern extraction that needs no model
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleExtractor;

#[async_trait]
impl Extractor for RuleExtractor {
    async fn extract(
        &self,
        text: &str,
        schema: &ExtractionSchema,
    ) -> Result<Value, CollaboratorError> {
        match schema {
            ExtractionSchema::YesNo => {
                let lowered = text.to_lowercase();
                let words: Vec<&str> = lowered
                    .split(|c: char| !(c.is_alphanumeric() || c == '\''))
                    .filter(|w| !w.is_empty())
                    .collect();
                let has = |set: &[&str]| words.iter().any(|w| set.contains(w));
                if has(NEGATIVE_WORDS) {
                    Ok(json!({ "answer": "no" }))
                } else if has(POSITIVE_WORDS) {
                    Ok(json!({ "answer": "yes" }))
                } else {
                    Err(CollaboratorError::malformed(format!(
                        "could not read yes or no from {text:?}"
                    )))
                }
            }
            ExtractionSchema::Email => Ok(json!({ "email_address": find_email(text) })),
        }
    }
}
