//! Retrieval over a local chunk index
//!
//! The index is a JSON-lines file, one chunk per line:
//!
//! ```text
//! {"content": "...", "metadata": {"source": "about.md"}, "embedding": [0.1, ...]}
//! ```
//!
//! It is opened and read on every search; nothing is held between calls.
//! When an embedding service is available and chunks carry embeddings,
//! chunks are ranked by cosine similarity to the query. Otherwise they are
//! ranked by how many query terms they contain.

use crate::llm::EmbeddingService;
use crate::runtime::{CollaboratorError, Retriever};
use crate::state_machine::{Document, ErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct IndexedChunk {
    content: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

pub struct IndexRetriever {
    path: PathBuf,
    embedder: Option<Arc<dyn EmbeddingService>>,
}

impl IndexRetriever {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingService>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    async fn load(&self) -> Result<Vec<IndexedChunk>, CollaboratorError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CollaboratorError::new(
                ErrorKind::Unknown,
                format!("Failed to open index {}: {e}", self.path.display()),
            )
        })?;

        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    CollaboratorError::malformed(format!(
                        "{}:{}: bad chunk: {e}",
                        self.path.display(),
                        n + 1
                    ))
                })
            })
            .collect()
    }

    async fn scores(
        &self,
        query: &str,
        chunks: &[IndexedChunk],
    ) -> Result<Vec<f32>, CollaboratorError> {
        let embedded = chunks.iter().all(|c| c.embedding.is_some());
        match &self.embedder {
            Some(embedder) if embedded && !chunks.is_empty() => {
                let mut vectors = embedder.embed(&[query.to_string()]).await?;
                let query_vec = vectors
                    .pop()
                    .ok_or_else(|| CollaboratorError::malformed("No embedding for query"))?;
                Ok(chunks
                    .iter()
                    .map(|c| cosine(&query_vec, c.embedding.as_deref().unwrap_or_default()))
                    .collect())
            }
            _ => {
                let terms = terms(query);
                Ok(chunks
                    .iter()
                    .map(|c| term_overlap(&terms, &c.content))
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Document>, CollaboratorError> {
        let chunks = self.load().await?;
        let scores = self.scores(query, &chunks).await?;

        let mut ranked: Vec<(f32, IndexedChunk)> = scores.into_iter().zip(chunks).collect();
        // Stable: equal scores keep index order
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let docs: Vec<Document> = ranked
            .into_iter()
            .take(k)
            .map(|(_, chunk)| {
                let mut doc = Document::new(chunk.content);
                doc.metadata = chunk.metadata;
                doc
            })
            .collect();
        tracing::debug!(query, k, returned = docs.len(), "Retrieval completed");
        Ok(docs)
    }
}

/// Retriever for deployments without an index; every search is empty
pub struct EmptyRetriever;

#[async_trait]
impl Retriever for EmptyRetriever {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<Document>, CollaboratorError> {
        Ok(Vec::new())
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[allow(clippy::cast_precision_loss)] // term counts are tiny
fn term_overlap(query_terms: &HashSet<String>, content: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms = terms(content);
    query_terms.intersection(&content_terms).count() as f32
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
