//! Server configuration from environment variables

use crate::steps::StepConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub model: String,
    pub embedding_model: String,
    /// JSON-lines chunk index; retrieval returns nothing when unset
    pub index_path: Option<PathBuf>,
    pub search_k: usize,
    pub collaborator_timeout: Duration,
    pub retry_base_delay: Duration,
    pub max_email_attempts: u32,
    pub gmail: Option<GmailConfig>,
}

#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub access_token: String,
    pub sender: String,
    pub cc: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = var("CONCIERGE_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".concierge").join("concierge.db")
            },
            PathBuf::from,
        );

        let gmail = match (var("GMAIL_ACCESS_TOKEN"), var("GMAIL_SENDER")) {
            (Some(access_token), Some(sender)) => Some(GmailConfig {
                access_token,
                sender,
                cc: var("CONCIERGE_EMAIL_CC")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        Self {
            db_path,
            port: parsed(&var, "CONCIERGE_PORT", 8000),
            openai_api_key: var("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            openai_base_url: var("OPENAI_BASE_URL"),
            model: var("CONCIERGE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            embedding_model: var("CONCIERGE_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            index_path: var("CONCIERGE_INDEX_PATH").map(PathBuf::from),
            search_k: parsed(&var, "CONCIERGE_SEARCH_K", 3),
            collaborator_timeout: Duration::from_secs(parsed(
                &var,
                "CONCIERGE_COLLABORATOR_TIMEOUT_SECS",
                30,
            )),
            retry_base_delay: Duration::from_millis(parsed(
                &var,
                "CONCIERGE_RETRY_BASE_DELAY_MS",
                1000,
            )),
            max_email_attempts: parsed(&var, "CONCIERGE_MAX_EMAIL_ATTEMPTS", 3),
            gmail,
        }
    }

    pub fn step_config(&self) -> StepConfig {
        StepConfig {
            search_k: self.search_k,
            max_email_attempts: self.max_email_attempts,
            collaborator_timeout: self.collaborator_timeout,
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            default
        }),
        None => default,
    }
}
