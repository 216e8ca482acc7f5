/// Batched text embedding with a context-window budget
///
/// `Embedder` plans batches that fit the embedding model's context, prefixes
/// every text with its task type, retries transport failures and returns one
/// vector per input. Failed batches come back as empty vectors ("duds") so the
/// output always lines up with the input.

pub mod remote;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::tokens::{split_to_fit, TokenCounter};

/// Instruction prefix telling the embedding model what the vector is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    SearchQuery,
    SearchDocument,
    Classification,
    Clustering,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SearchQuery => "search_query",
            TaskType::SearchDocument => "search_document",
            TaskType::Classification => "classification",
            TaskType::Clustering => "clustering",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search_query" => Ok(TaskType::SearchQuery),
            "search_document" => Ok(TaskType::SearchDocument),
            "classification" => Ok(TaskType::Classification),
            "clustering" => Ok(TaskType::Clustering),
            other => Err(format!("Unknown embedding task type: {}", other)),
        }
    }
}

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Transport or decoding failure
    #[error("Embedding generation error: {0}")]
    Generation(String),

    /// Embedding service returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Service answered with a different number of vectors than requested
    #[error("Expected {expected} embeddings, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Provider not configured (e.g., missing endpoint)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Raw access to an embedding service.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn EmbeddingProvider>).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch in one request; one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Return the model or endpoint identifier.
    fn model_name(&self) -> &str;
}

#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    tokens: TokenCounter,
    context_len: usize,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, tokens: TokenCounter, context_len: usize) -> Self {
        Embedder {
            provider,
            tokens,
            context_len,
            retry: RetryPolicy::SHORT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn context_len(&self) -> usize {
        self.context_len
    }

    /// Embed every text. `result.len() == texts.len()`; failures yield empty vectors.
    pub async fn embed(&self, texts: &[String], task: TaskType) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }

        // the task prefix counts against the context budget
        let inputs: Vec<String> = texts.iter().map(|t| format!("{}: {}", task, t)).collect();
        let counts: Vec<usize> = inputs.iter().map(|t| self.tokens.count(t)).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for range in split_to_fit(&counts, self.context_len) {
            vectors.extend(self.embed_range(&inputs[range], task).await);
        }
        vectors
    }

    pub async fn embed_one(&self, text: &str, task: TaskType) -> Option<Vec<f32>> {
        self.embed(&[text.to_string()], task)
            .await
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
    }

    /// Embed already prefixed inputs in one request.
    async fn embed_range(&self, inputs: &[String], task: TaskType) -> Vec<Vec<f32>> {
        let provider = &self.provider;

        let result = self
            .retry
            .run(
                |e| !matches!(e, EmbeddingError::SizeMismatch { .. }),
                move || async move {
                    let vectors = provider.embed_batch(inputs).await?;
                    if vectors.len() != inputs.len() {
                        return Err(EmbeddingError::SizeMismatch {
                            expected: inputs.len(),
                            actual: vectors.len(),
                        });
                    }
                    Ok(vectors)
                },
            )
            .await;

        match result {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!(
                    model = self.provider.model_name(),
                    batch_size = inputs.len(),
                    task = %task,
                    error = %e,
                    "Embedding batch failed, returning duds"
                );
                vec![Vec::new(); inputs.len()]
            }
        }
    }
}
