use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beansack::embedding::{Embedder, EmbeddingError, EmbeddingProvider};
use beansack::extraction::{prompts, ChatMessage, ChatModel, ExtractionError, Extractor, BATCH_DELIMITER};
use beansack::retry::RetryPolicy;
use beansack::sack::models::{Bean, Kind, MediaNoise};
use beansack::sack::BeanSack;
use beansack::search::retrieval::CLASSIFICATION_MIN_SCORE;
use beansack::search::SearchOptions;
use beansack::store::memory::MemoryBackend;
use beansack::tokens::TokenCounter;

const TOPICS: [&str; 6] = ["ai", "chips", "rates", "football", "climate", "space"];

/// One dimension per topic word plus one for everything else.
fn topic_vector(text: &str) -> Vec<f32> {
    let words: Vec<String> = text.split(|c: char| !c.is_alphanumeric()).map(|w| w.to_lowercase()).collect();
    let mut vector: Vec<f32> = TOPICS.iter().map(|t| words.iter().filter(|w| w == t).count() as f32).collect();
    vector.push(if vector.iter().all(|x| *x == 0.0) { 1.0 } else { 0.0 });
    vector
}

fn topics_in(text: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if let Some(t) = TOPICS.iter().find(|t| **t == word.to_lowercase()) {
            if !found.contains(t) {
                found.push(*t);
            }
        }
    }
    found
}

struct TopicEmbedder;

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| topic_vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        "topic-vector"
    }
}

struct TopicChat;

#[async_trait]
impl ChatModel for TopicChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ExtractionError> {
        let input = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let keyconcepts = messages.first().is_some_and(|m| m.content.contains(prompts::KEYCONCEPTS.task));

        let reply = if keyconcepts {
            let concepts: Vec<_> = input
                .split(BATCH_DELIMITER)
                .filter_map(|doc| {
                    let topics = topics_in(doc);
                    let first = topics.first()?;
                    Some(json!({"keyphrase": first, "event": "update", "description": topics.join(" ")}))
                })
                .collect();
            json!({ "concepts": concepts })
        } else {
            let topics = topics_in(input);
            json!({
                "summary": format!("Coverage of {}.", topics.join(" and ")),
                "topic": topics.first().copied().unwrap_or("general"),
            })
        };
        Ok(reply.to_string())
    }

    fn model_name(&self) -> &str {
        "topic-chat"
    }
}

fn create_sack() -> Arc<BeanSack> {
    let tokens = TokenCounter::whitespace().unwrap();
    let retry = RetryPolicy::new(1, Duration::ZERO);
    let embedder = Embedder::new(Arc::new(TopicEmbedder), tokens.clone(), 64).with_retry(retry);
    let extractor = Extractor::new(Arc::new(TopicChat), tokens.clone()).with_retry(retry);
    Arc::new(BeanSack::new(Arc::new(MemoryBackend::new()), embedder, extractor, tokens, 2).unwrap())
}

fn article(url: &str, topics: &str) -> Bean {
    Bean {
        url: url.to_string(),
        source: "wire".to_string(),
        title: format!("Report {}", url),
        text: format!(
            "{topics} correspondents filed a report today that covers the latest developments \
             in depth and includes comments from several people close to the matter"
        ),
        kind: Kind::Article,
        created: 1_700_000_000,
        ..Default::default()
    }
}

async fn ingest(sack: &Arc<BeanSack>, beans: Vec<Bean>) {
    sack.add_beans(beans).await.unwrap();
    sack.flush().await;
    sack.remap_nuggets(2).await;
}

#[tokio::test]
async fn test_single_bean_is_enriched() {
    let sack = create_sack();
    let mut long = article("https://news.example/1", "climate");
    long.text = format!("{} {}", long.text, "padding ".repeat(200));

    let report = sack.add_beans(vec![long]).await.unwrap();
    sack.flush().await;

    assert_eq!(report.inserted, 1);
    let beans = sack.retrieve(&SearchOptions::new()).await;
    assert_eq!(beans.len(), 1);
    let bean = &beans[0];
    assert_eq!(bean.topic.as_deref(), Some("climate"));
    assert!(bean.summary.as_deref().is_some_and(|s| s.contains("climate")));
    assert!(bean.category_embeddings.as_ref().is_some_and(|v| !v.is_empty()));
    assert!(bean.text.split_whitespace().count() <= 64);
    assert!(bean.updated > 0);
}

#[tokio::test]
async fn test_double_ingest_keeps_one_bean() {
    let sack = create_sack();

    let first = sack.add_beans(vec![article("https://news.example/1", "space")]).await.unwrap();
    let second = sack.add_beans(vec![article("https://news.example/1", "space")]).await.unwrap();
    sack.flush().await;

    assert_eq!(first.inserted, 1);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.accepted, 1);
    assert_eq!(sack.retrieve(&SearchOptions::new()).await.len(), 1);
}

#[tokio::test]
async fn test_short_text_is_ignored() {
    let sack = create_sack();
    let mut short = article("https://news.example/short", "ai");
    short.text = "ai chips in brief".to_string();

    let report = sack.add_beans(vec![short]).await.unwrap();
    sack.flush().await;

    assert_eq!(report.accepted, 0);
    assert_eq!(report.inserted, 0);
    assert!(sack.retrieve(&SearchOptions::new()).await.is_empty());
}

#[tokio::test]
async fn test_overlapping_topics_share_a_nugget() {
    let sack = create_sack();
    ingest(
        &sack,
        vec![
            article("https://a.example/1", "ai chips"),
            article("https://b.example/2", "ai chips"),
            article("https://c.example/3", "football"),
        ],
    )
    .await;

    let nuggets = sack.trending_nuggets(&SearchOptions::new().with_time_window(1)).await;
    let ai = nuggets.iter().find(|n| n.keyphrase == "ai").expect("ai nugget");

    let urls: HashSet<&str> = ai.mapped_urls.iter().map(String::as_str).collect();
    assert!(urls.contains("https://a.example/1"));
    assert!(urls.contains("https://b.example/2"));
    assert!(!urls.contains("https://c.example/3"));
    assert!(ai.match_count >= 10);
}

#[tokio::test]
async fn test_fuzzy_search_by_category() {
    let sack = create_sack();
    ingest(
        &sack,
        vec![
            article("https://a.example/1", "ai"),
            article("https://a.example/2", "ai chips"),
            article("https://a.example/3", "ai climate"),
            article("https://r.example/4", "rates"),
        ],
    )
    .await;

    let opts = SearchOptions::new()
        .with_search_texts(vec!["ai".to_string()])
        .with_time_window(1)
        .with_top_n(2);
    let beans = sack.fuzzy_search(&opts).await;

    assert_eq!(beans.len(), 2);
    assert_eq!(beans[0].url, "https://a.example/1");
    assert!(beans.iter().all(|b| b.search_score.unwrap_or(0.0) >= CLASSIFICATION_MIN_SCORE));
    assert!(beans.iter().all(|b| b.url != "https://r.example/4"));

    let none = sack
        .fuzzy_search(&SearchOptions::new().with_search_texts(vec!["space".to_string()]))
        .await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_trending_nuggets_sorted_by_match_count() {
    let sack = create_sack();
    ingest(
        &sack,
        vec![
            article("https://a.example/1", "ai"),
            article("https://a.example/2", "ai"),
            article("https://a.example/3", "ai"),
            article("https://f.example/4", "football"),
        ],
    )
    .await;

    let nuggets = sack.trending_nuggets(&SearchOptions::new().with_time_window(1)).await;

    assert!(!nuggets.is_empty());
    assert_eq!(nuggets[0].keyphrase, "ai");
    assert!(nuggets.windows(2).all(|w| w[0].match_count >= w[1].match_count));
    assert!(nuggets.iter().any(|n| n.keyphrase == "football" && n.match_count == 5));

    let trending = sack.trending_beans(&SearchOptions::new()).await;
    assert_eq!(trending.last().map(|b| b.url.as_str()), Some("https://f.example/4"));
}

#[tokio::test]
async fn test_media_noise_attached_to_search_results() {
    let sack = create_sack();
    let mut bean = article("https://social.example/1", "space");
    bean.media_noise = Some(MediaNoise {
        source: "forum".to_string(),
        likes: 10,
        comments: 2,
        ..Default::default()
    });
    ingest(&sack, vec![bean]).await;

    let beans = sack.text_search(&["space".to_string()], &SearchOptions::new()).await;

    assert_eq!(beans.len(), 1);
    let noise = beans[0].media_noise.as_ref().expect("noise attached");
    assert_eq!(noise.score, 16.0);

    let total = sack.media_noise_score(&["https://social.example/1".to_string()], true).await;
    assert_eq!(total[0].score, 16.0);
}

#[tokio::test]
async fn test_rectify_after_full_ingest_is_a_no_op() {
    let sack = create_sack();
    ingest(&sack, vec![article("https://a.example/1", "climate")]).await;

    let report = sack.rectify().await;

    assert_eq!(report.beans_updated, 0);
    assert_eq!(report.nuggets_embedded, 0);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let sack = create_sack();
    ingest(&sack, vec![article("https://a.example/1", "climate"), article("https://a.example/2", "rates")]).await;

    let kept = sack.cleanup(30).await;
    assert_eq!(kept.beans, 0);

    let removed = sack.cleanup(0).await;
    assert_eq!(removed.beans, 2);
    assert!(removed.nuggets >= 1);
    assert!(sack.retrieve(&SearchOptions::new()).await.is_empty());

    let again = sack.cleanup(0).await;
    assert_eq!((again.beans, again.noises, again.nuggets), (0, 0, 0));
}
