/// Ingest and enrichment of new beans
///
/// `add_beans` filters, truncates and stores beans and their noise, then
/// enriches only the newly inserted ones. Nugget generation and the remap run
/// as detached background tasks; category embeddings and digests are generated
/// inline, one field after the other.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::models::{self, Bean, BeanNugget, GeneratedField, Kind, MediaNoise};
use super::BeanSack;
use crate::embedding::TaskType;
use crate::errors::SackError;
use crate::store::query::{with_filter, with_min_search_score, with_projection, with_top_n, Filter, Projection};

/// Beans with shorter text are neither stored nor enriched.
pub const MIN_TEXT_LENGTH: usize = 100;

/// Recency window of the remap that follows every ingest.
pub const REMAP_WINDOW_DAYS: i64 = 2;

const NUGGET_MATCH_MIN_SCORE: f64 = 0.73;
const NUGGET_MATCH_TOP_N: usize = 100;
const NUGGET_TEXT_MIN_SCORE: f64 = 10.0;
const NUGGET_TEXT_TOP_N: usize = 2;

/// Trend score contributed by each bean a nugget maps to.
pub const URL_MATCH_WEIGHT: i64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Beans that passed the length and kind filter
    pub accepted: usize,
    /// Beans that were new and got stored
    pub inserted: usize,
    /// Noise records stored
    pub noises: usize,
}

impl BeanSack {
    /// Store new beans and kick off their enrichment.
    ///
    /// Only a failure to insert the beans themselves is an error. Noise, nuggets,
    /// derived fields and the remap are best-effort.
    pub async fn add_beans(self: &Arc<Self>, beans: Vec<Bean>) -> Result<IngestReport, SackError> {
        let now = models::now();
        let context = self.embedder.context_len();

        let mut accepted = Vec::with_capacity(beans.len());
        let mut noises = Vec::new();
        for mut bean in beans {
            if bean.kind == Kind::Channel || bean.text.chars().count() < MIN_TEXT_LENGTH {
                continue;
            }
            if let Some(mut noise) = bean.media_noise.take() {
                noise.mapped_url = bean.url.clone();
                noise.digest = noise.digest.map(|d| self.tokens.truncate(&d, context));
                noises.push(noise);
            }
            bean.search_score = None;
            bean.updated = now;
            bean.text = self.tokens.truncate(&bean.text, context);
            accepted.push(bean);
        }

        if accepted.is_empty() {
            tracing::debug!("No beans passed the ingest filter");
            return Ok(IngestReport::default());
        }
        let mut report = IngestReport { accepted: accepted.len(), ..Default::default() };

        let inserted = self.beans.add(accepted).await?;
        report.inserted = inserted.len();
        report.noises = self.store_noise(noises, now).await;

        if !inserted.is_empty() {
            let texts: Vec<String> = inserted.iter().map(|b| b.text.clone()).collect();
            let sack = Arc::clone(self);
            self.spawn_background("nuggets", async move {
                sack.generate_nuggets(texts, now).await;
            });

            for field in GeneratedField::ALL {
                self.generate_field_for_beans(field, &inserted).await;
            }

            let sack = Arc::clone(self);
            self.spawn_background("remap", async move {
                sack.remap_nuggets(REMAP_WINDOW_DAYS).await;
            });
        }

        tracing::info!(
            accepted = report.accepted,
            inserted = report.inserted,
            noises = report.noises,
            "Ingested beans"
        );
        Ok(report)
    }

    /// Insert noise and bump `updated` on the beans it belongs to.
    async fn store_noise(&self, mut noises: Vec<MediaNoise>, now: i64) -> usize {
        if noises.is_empty() {
            return 0;
        }
        for noise in &mut noises {
            noise.updated = now;
        }
        let filters: Vec<Filter> = noises.iter().map(|n| Filter::eq("url", n.mapped_url.as_str())).collect();

        let stored = match self.noises.add(noises).await {
            Ok(stored) => stored.len(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to store media noise");
                return 0;
            }
        };

        let touches = vec![json!({"updated": now}); filters.len()];
        self.beans.update(&touches, &filters).await;
        stored
    }

    /// Compute `field` for `beans` and write back the non-dud results.
    /// Returns the number of beans updated.
    pub async fn generate_field_for_beans(&self, field: GeneratedField, beans: &[Bean]) -> u64 {
        if beans.is_empty() {
            return 0;
        }
        let texts: Vec<String> = beans.iter().map(|b| b.text.clone()).collect();

        let updates: Vec<(Filter, Value)> = match field {
            GeneratedField::CategoryEmbeddings => self
                .embedder
                .embed(&texts, TaskType::Classification)
                .await
                .into_iter()
                .zip(beans)
                .filter(|(vector, _)| !vector.is_empty())
                .map(|(vector, bean)| (url_filter(bean), json!({ "category_embeddings": vector })))
                .collect(),
            GeneratedField::Summary => self
                .extractor
                .extract_digests(&texts)
                .await
                .into_iter()
                .zip(beans)
                .filter(|(digest, _)| !digest.is_dud())
                .map(|(digest, bean)| (url_filter(bean), json!({ "summary": digest.summary, "topic": digest.topic })))
                .collect(),
        };

        let (filters, sets): (Vec<Filter>, Vec<Value>) = updates.into_iter().unzip();
        let updated = self.beans.update(&sets, &filters).await;
        tracing::info!(
            field = field.field_name(),
            requested = beans.len(),
            updated,
            "Generated bean field"
        );
        updated
    }

    async fn generate_nuggets(&self, texts: Vec<String>, batch_time: i64) {
        let concepts = self.extractor.extract_keyconcepts(&texts).await;
        if concepts.is_empty() {
            tracing::debug!(beans = texts.len(), "No keyconcepts extracted");
            return;
        }

        let descriptions: Vec<String> = concepts.iter().map(|c| c.description.clone()).collect();
        let vectors = self.embedder.embed(&descriptions, TaskType::SearchQuery).await;

        let nuggets: Vec<BeanNugget> = concepts
            .into_iter()
            .zip(vectors)
            .map(|(concept, vector)| BeanNugget {
                id: Some(Uuid::new_v4().to_string()),
                keyphrase: concept.keyphrase,
                event: concept.event,
                description: concept.description,
                embeddings: (!vector.is_empty()).then_some(vector),
                updated: batch_time,
                match_count: 0,
                mapped_urls: Vec::new(),
            })
            .collect();

        match self.nuggets.add(nuggets).await {
            Ok(stored) => tracing::info!(count = stored.len(), "Stored nuggets"),
            Err(e) => tracing::warn!(error = %e, "Failed to store nuggets"),
        }
    }

    /// Recompute `mapped_urls` and `match_count` for nuggets updated within `window_days`.
    /// Returns the number of nuggets rewritten.
    pub async fn remap_nuggets(&self, window_days: i64) -> u64 {
        let filter = Filter::exists("embeddings", true).and(models::updated_in_last(window_days));
        let projection = Projection::include(&["_id", "keyphrase", "event", "embeddings"]);
        let nuggets = match self.nuggets.get(&filter, Some(&projection), None, 0).await {
            Ok(nuggets) => nuggets,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load nuggets for remap");
                return 0;
            }
        };

        let mut filters = Vec::with_capacity(nuggets.len());
        let mut sets = Vec::with_capacity(nuggets.len());
        for nugget in &nuggets {
            let Some(id) = nugget.id.as_deref() else {
                continue;
            };
            let urls = self.match_beans(nugget).await;
            let noise = self
                .media_noise_score(&urls, true)
                .await
                .first()
                .map_or(0, |n| n.score as i64);
            let match_count = URL_MATCH_WEIGHT * urls.len() as i64 + noise;

            filters.push(Filter::eq("_id", id));
            sets.push(json!({ "match_count": match_count, "mapped_urls": urls }));
        }

        let updated = self.nuggets.update(&sets, &filters).await;
        tracing::info!(window_days, nuggets = nuggets.len(), updated, "Remapped nuggets");
        updated
    }

    /// Unique urls of the beans a nugget points at: semantic neighbours first,
    /// lexical matches on keyphrase and event when there are none.
    async fn match_beans(&self, nugget: &BeanNugget) -> Vec<String> {
        let not_channel = Filter::ne("kind", Kind::Channel.as_str());
        let url_only = Projection::include(&["url"]);

        let vector = nugget.embeddings.clone().unwrap_or_default();
        let mut hits = self
            .beans
            .vector_search(
                &[vector],
                GeneratedField::CategoryEmbeddings.field_name(),
                &[
                    with_filter(not_channel.clone()),
                    with_top_n(NUGGET_MATCH_TOP_N),
                    with_min_search_score(NUGGET_MATCH_MIN_SCORE),
                    with_projection(url_only.clone()),
                ],
            )
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Nugget vector match failed");
                Vec::new()
            });

        if hits.is_empty() {
            let terms = [nugget.keyphrase.clone(), nugget.event.clone()];
            hits = self
                .beans
                .text_search(
                    &terms,
                    &[
                        with_filter(not_channel),
                        with_min_search_score(NUGGET_TEXT_MIN_SCORE),
                        with_top_n(NUGGET_TEXT_TOP_N),
                        with_projection(url_only),
                    ],
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Nugget text match failed");
                    Vec::new()
                });
        }

        let mut seen = HashSet::new();
        hits.into_iter()
            .map(|b| b.url)
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }
}

fn url_filter(bean: &Bean) -> Filter {
    Filter::eq("url", bean.url.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sack::testing::{bean, create_test_sack, long_text};
    use crate::store::query::Filter;

    #[tokio::test]
    async fn test_add_beans_filters_short_and_channel() {
        let sack = create_test_sack();
        let beans = vec![
            bean("https://a.com/1", &long_text("ai chips")),
            bean("https://a.com/short", "too short"),
            Bean { kind: Kind::Channel, ..bean("https://a.com/channel", &long_text("ai")) },
        ];

        let report = sack.add_beans(beans).await.unwrap();
        sack.flush().await;

        assert_eq!(report, IngestReport { accepted: 1, inserted: 1, noises: 0 });
        let stored = sack.beans.get(&Filter::All, None, None, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].url, "https://a.com/1");
    }

    #[tokio::test]
    async fn test_add_beans_generates_fields_for_new_beans() {
        let sack = create_test_sack();
        sack.add_beans(vec![bean("https://a.com/1", &long_text("rates election"))]).await.unwrap();
        sack.flush().await;

        let stored = sack.beans.get(&Filter::All, None, None, 0).await.unwrap();
        let b = &stored[0];
        assert!(b.category_embeddings.as_ref().is_some_and(|v| !v.is_empty()));
        assert!(b.summary.as_ref().is_some_and(|s| !s.is_empty()));
        assert_eq!(b.topic.as_deref(), Some("rates"));
        assert!(b.updated > 0);
    }

    #[tokio::test]
    async fn test_second_ingest_is_not_reenriched() {
        let sack = create_test_sack();
        let b = bean("https://a.com/1", &long_text("football"));

        let first = sack.add_beans(vec![b.clone()]).await.unwrap();
        let second = sack.add_beans(vec![b]).await.unwrap();
        sack.flush().await;

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(sack.beans.get(&Filter::All, None, None, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_noise_is_detached_and_stored() {
        let sack = create_test_sack();
        let mut b = bean("https://a.com/1", &long_text("climate"));
        b.media_noise = Some(MediaNoise { source: "reddit".to_string(), likes: 10, comments: 2, ..Default::default() });

        let report = sack.add_beans(vec![b]).await.unwrap();
        sack.flush().await;

        assert_eq!(report.noises, 1);
        let noises = sack.noises.get(&Filter::All, None, None, 0).await.unwrap();
        assert_eq!(noises[0].mapped_url, "https://a.com/1");
        let stored = sack.beans.get(&Filter::All, None, None, 0).await.unwrap();
        assert!(stored[0].media_noise.is_none());
    }

    #[tokio::test]
    async fn test_reingest_with_noise_advances_updated() {
        let sack = create_test_sack();
        let old = models::now() - 10 * 86_400;
        sack.beans
            .add(vec![Bean { updated: old, ..bean("https://a.com/1", &long_text("climate")) }])
            .await
            .unwrap();

        let mut again = bean("https://a.com/1", &long_text("climate"));
        again.media_noise = Some(MediaNoise { source: "reddit".to_string(), likes: 3, ..Default::default() });
        let report = sack.add_beans(vec![again]).await.unwrap();
        sack.flush().await;

        assert_eq!(report.inserted, 0);
        assert_eq!(report.noises, 1);
        let stored = sack.beans.get(&Filter::All, None, None, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].updated > old);
        assert!(models::now() - stored[0].updated < 60);
    }

    #[tokio::test]
    async fn test_duplicate_only_ingest_spawns_nothing() {
        let sack = create_test_sack();
        sack.add_beans(vec![bean("https://a.com/1", &long_text("space"))]).await.unwrap();
        sack.flush().await;

        let report = sack.add_beans(vec![bean("https://a.com/1", &long_text("space"))]).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(sack.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_text_is_truncated_to_context() {
        let sack = create_test_sack();
        let text = vec!["word"; 5000].join(" ");
        sack.add_beans(vec![bean("https://a.com/long", &text)]).await.unwrap();
        sack.flush().await;

        let stored = sack.beans.get(&Filter::All, None, None, 0).await.unwrap();
        assert!(sack.tokens.count(&stored[0].text) <= sack.embedder.context_len());
    }

    #[tokio::test]
    async fn test_remap_maps_overlapping_beans() {
        let sack = create_test_sack();
        sack.add_beans(vec![
            bean("https://a.com/1", &long_text("ai chips")),
            bean("https://b.com/2", &long_text("ai chips")),
            bean("https://c.com/3", &long_text("football")),
        ])
        .await
        .unwrap();
        sack.flush().await;

        sack.remap_nuggets(REMAP_WINDOW_DAYS).await;

        let nuggets = sack.nuggets.get(&Filter::eq("keyphrase", "ai"), None, None, 0).await.unwrap();
        assert!(!nuggets.is_empty());
        let ai = &nuggets[0];
        assert!(ai.mapped_urls.contains(&"https://a.com/1".to_string()));
        assert!(ai.mapped_urls.contains(&"https://b.com/2".to_string()));
        assert!(!ai.mapped_urls.contains(&"https://c.com/3".to_string()));
        assert!(ai.match_count >= 10);
    }
}
