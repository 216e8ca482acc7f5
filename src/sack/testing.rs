/// Deterministic embedding and chat fakes for unit tests

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::models::{Bean, Kind};
use super::BeanSack;
use crate::embedding::{Embedder, EmbeddingError, EmbeddingProvider};
use crate::extraction::{prompts, ChatMessage, ChatModel, ExtractionError, Extractor, BATCH_DELIMITER};
use crate::retry::RetryPolicy;
use crate::store::memory::MemoryBackend;
use crate::tokens::TokenCounter;

/// Topic words; each one is a dimension of the fake embedding space.
pub const VOCAB: [&str; 8] = ["ai", "chips", "rates", "election", "football", "climate", "space", "crypto"];

const FILLER: &str = "reported on the matter in a detailed story that was published this morning \
                      with several quotes from analysts and officials";

/// Topic words followed by neutral filler, long enough to pass the ingest filter.
pub fn long_text(topic: &str) -> String {
    format!("{} {}", topic, FILLER)
}

pub fn bean(url: &str, text: &str) -> Bean {
    Bean {
        url: url.to_string(),
        source: "example".to_string(),
        title: format!("Story at {}", url),
        text: text.to_string(),
        kind: Kind::Article,
        created: 1_700_000_000,
        ..Default::default()
    }
}

fn topic_words(text: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if let Some(v) = VOCAB.iter().find(|v| **v == word) {
            if !found.contains(v) {
                found.push(*v);
            }
        }
    }
    found
}

/// Counts vocabulary words; texts without any land on an extra "other" axis.
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let words: Vec<String> = text.split(|c: char| !c.is_alphanumeric()).map(|w| w.to_lowercase()).collect();
    let mut vector: Vec<f32> = VOCAB.iter().map(|v| words.iter().filter(|w| *w == v).count() as f32).collect();
    let other = if vector.iter().all(|x| *x == 0.0) { 1.0 } else { 0.0 };
    vector.push(other);
    vector
}

pub struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        "keyword"
    }
}

/// Digest: summary and topic from the topic words. Keyconcepts: one per document
/// keyed by its first topic word, described by all of them.
pub struct TopicChat;

#[async_trait]
impl ChatModel for TopicChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractionError> {
        let input = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let input = input.strip_prefix("INPUT:\n```\n").unwrap_or(input);
        let input = input.strip_suffix("\n```").unwrap_or(input);

        let is_keyconcepts = messages.first().is_some_and(|m| m.content.contains(prompts::KEYCONCEPTS.task));
        let reply = if is_keyconcepts {
            let concepts: Vec<_> = input
                .split(BATCH_DELIMITER)
                .filter_map(|doc| {
                    let words = topic_words(doc);
                    let first = words.first()?;
                    Some(json!({"keyphrase": first, "event": "news", "description": words.join(" ")}))
                })
                .collect();
            json!({ "concepts": concepts })
        } else {
            let words = topic_words(input);
            json!({
                "summary": format!("A story about {}.", words.join(" and ")),
                "topic": words.first().copied().unwrap_or("general"),
            })
        };
        Ok(reply.to_string())
    }

    fn model_name(&self) -> &str {
        "topic"
    }
}

pub fn create_test_sack() -> Arc<BeanSack> {
    let tokens = TokenCounter::whitespace().unwrap();
    let no_wait = RetryPolicy::new(1, Duration::ZERO);
    let embedder = Embedder::new(Arc::new(KeywordEmbedder), tokens.clone(), 512).with_retry(no_wait);
    let extractor = Extractor::new(Arc::new(TopicChat), tokens.clone()).with_retry(no_wait);
    Arc::new(BeanSack::new(Arc::new(MemoryBackend::new()), embedder, extractor, tokens, 4).unwrap())
}
