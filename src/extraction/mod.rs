/// Language-model extraction of digests and keyconcepts
///
/// `Extractor` turns bean texts into per-document digests (`{summary, topic}`)
/// and per-batch keyconcept lists. Every call is prompted with the JSON schema of
/// the expected output, parsed strictly, repaired once on a format error and
/// retried with a long delay when the service reports overload.
/// Failures degrade to duds, never to errors.

pub mod openai;
pub mod parser;
pub mod prompts;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::tokens::{split_to_fit, TokenCounter};

use prompts::PromptTemplate;

/// Token window of the chat model a keyconcept batch must fit in.
pub const MODEL_WINDOW: usize = 6000;

/// Separator between documents stuffed into one keyconcept prompt.
pub const BATCH_DELIMITER: &str = "\n```\n";

/// Errors that can occur during extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Transport or decoding failure
    #[error("Extraction generation error: {0}")]
    Generation(String),

    /// Chat service returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Model output was not the requested JSON
    #[error("Failed to parse model output ({reason}): {text}")]
    Parse { text: String, reason: String },

    /// Provider not configured (e.g., missing API key)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage { role, content: content.into() }
    }
}

/// Chat completion seam.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn ChatModel>).
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete the conversation and return the assistant's raw text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractionError>;

    fn model_name(&self) -> &str;
}

/// Summary and topic of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Digest {
    /// A concise summary of the content in no more than three sentences
    #[serde(default)]
    pub summary: String,
    /// The single main topic of the content in a short phrase
    #[serde(default)]
    pub topic: String,
}

impl Digest {
    pub fn is_dud(&self) -> bool {
        self.summary.trim().is_empty()
    }
}

/// A newsworthy keyphrase, the event it relates to and a one-line description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeyConcept {
    /// Name of the person, organization, product or technology at the center of the news
    #[serde(default)]
    pub keyphrase: String,
    /// The event, action or development involving the keyphrase
    #[serde(default)]
    pub event: String,
    /// One sentence describing what happened
    #[serde(default)]
    pub description: String,
}

impl KeyConcept {
    pub fn is_dud(&self) -> bool {
        self.description.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeyConceptList {
    #[serde(default)]
    pub concepts: Vec<KeyConcept>,
}

#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn ChatModel>,
    tokens: TokenCounter,
    window: usize,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(model: Arc<dyn ChatModel>, tokens: TokenCounter) -> Self {
        Extractor {
            model,
            tokens,
            window: MODEL_WINDOW,
            retry: RetryPolicy::LONG,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// One digest per text, in order. Failures yield `Digest::default()`.
    pub async fn extract_digests(&self, texts: &[String]) -> Vec<Digest> {
        let mut digests = Vec::with_capacity(texts.len());
        for text in texts {
            let digest = match self.run::<Digest>(&prompts::DIGEST, text).await {
                Ok(digest) => digest,
                Err(e) => {
                    tracing::warn!(model = self.model.model_name(), error = %e, "Digest extraction failed");
                    Digest::default()
                }
            };
            digests.push(digest);
        }
        digests
    }

    /// Keyconcepts across all texts, flattened. Duds are dropped.
    pub async fn extract_keyconcepts(&self, texts: &[String]) -> Vec<KeyConcept> {
        let delimiter = self.tokens.count(BATCH_DELIMITER);
        let counts: Vec<usize> = texts.iter().map(|t| self.tokens.count(t) + delimiter).collect();

        let mut concepts = Vec::new();
        for range in split_to_fit(&counts, self.window) {
            let input = texts[range.clone()].join(BATCH_DELIMITER);
            match self.run::<KeyConceptList>(&prompts::KEYCONCEPTS, &input).await {
                Ok(list) => concepts.extend(list.concepts.into_iter().filter(|c| !c.is_dud())),
                Err(e) => tracing::warn!(
                    model = self.model.model_name(),
                    batch_size = range.len(),
                    error = %e,
                    "Keyconcept extraction failed"
                ),
            }
        }
        concepts
    }

    async fn run<T>(&self, template: &PromptTemplate, input: &str) -> Result<T, ExtractionError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = schema_of::<T>();
        let schema = schema.as_str();
        let model = &self.model;

        self.retry
            .run(is_server_error, move || async move {
                let messages = template.messages(template.instruction, schema, input);
                let output = model.complete(&messages).await?;
                match parser::parse_json::<T>(&output) {
                    Err(ExtractionError::Parse { reason, .. }) => {
                        tracing::debug!(reason = %reason, "Model output is not valid JSON, asking for a reformat");
                        let repair = template.messages(prompts::FORMAT_REPAIR_INSTRUCTION, schema, &output);
                        let fixed = model.complete(&repair).await?;
                        parser::parse_json::<T>(&fixed)
                    }
                    parsed => parsed,
                }
            })
            .await
    }
}

fn schema_of<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schemars::schema_for!(T)).unwrap_or_default()
}

/// Rate limiting or overload on the chat service.
fn is_server_error(error: &ExtractionError) -> bool {
    static OVERLOAD: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = OVERLOAD.get_or_init(|| {
        Regex::new(r"(?i)\b(429|503)\b|rate.?limit|too many requests|service unavailable|overloaded").ok()
    });

    match error {
        ExtractionError::Api { status, .. } if *status == 429 || *status == 503 => true,
        ExtractionError::Api { .. } | ExtractionError::Generation(_) => {
            pattern.as_ref().is_some_and(|re| re.is_match(&error.to_string()))
        }
        _ => false,
    }
}
