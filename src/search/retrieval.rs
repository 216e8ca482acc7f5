/// Scalar, lexical, semantic and nugget-driven bean retrieval
///
/// Query failures are logged and surface as empty result sets.

use std::collections::HashSet;

use super::{SearchOptions, RETRIEVE_FIELDS, SEARCH_FIELDS};
use crate::embedding::TaskType;
use crate::errors::SackError;
use crate::sack::models::{Bean, BeanNugget, GeneratedField};
use crate::sack::BeanSack;
use crate::store::query::{with_filter, with_min_search_score, with_projection, with_top_n, Filter, Projection, Sort};

/// Minimum cosine similarity for category and embedding queries.
pub const CLASSIFICATION_MIN_SCORE: f64 = 0.68;
/// Minimum cosine similarity for free-text context queries.
pub const CONTEXT_MIN_SCORE: f64 = 0.60;

/// How `fuzzy_search` answers a given set of options.
#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyMode {
    /// Nearest neighbours on the category embeddings
    Vector {
        vectors: Vec<Vec<f32>>,
        min_score: f64,
        /// Keywords for a lexical search when nothing is close enough
        fallback: Option<String>,
    },
    /// Most recent beans matching the scalar filter
    Scalar,
}

impl BeanSack {
    /// Most recent beans matching the scalar filter, with the full retrieval projection.
    pub async fn retrieve(&self, opts: &SearchOptions) -> Vec<Bean> {
        let result = self
            .beans
            .get(
                &opts.to_filter(),
                Some(&Projection::include(RETRIEVE_FIELDS)),
                Some(&Sort::desc("updated")),
                opts.top_n as i64,
            )
            .await;
        logged("retrieve", result)
    }

    /// Lexical search over title, summary, topic and keywords.
    pub async fn text_search(&self, keywords: &[String], opts: &SearchOptions) -> Vec<Bean> {
        let result = self
            .beans
            .text_search(
                keywords,
                &[
                    with_filter(opts.to_filter()),
                    with_top_n(opts.top_n),
                    with_projection(Projection::include(SEARCH_FIELDS)),
                ],
            )
            .await;
        self.attach_noise(logged("text_search", result)).await
    }

    /// Semantic search chosen from the options' inputs. See [`FuzzyMode`].
    pub async fn fuzzy_search(&self, opts: &SearchOptions) -> Vec<Bean> {
        let beans = self.fuzzy_candidates(opts).await;
        self.attach_noise(beans).await
    }

    pub async fn fuzzy_mode(&self, opts: &SearchOptions) -> FuzzyMode {
        if !opts.search_embeddings.is_empty() {
            FuzzyMode::Vector {
                vectors: opts.search_embeddings.clone(),
                min_score: CLASSIFICATION_MIN_SCORE,
                fallback: None,
            }
        } else if !opts.search_texts.is_empty() {
            FuzzyMode::Vector {
                vectors: self.embedder.embed(&opts.search_texts, TaskType::Classification).await,
                min_score: CLASSIFICATION_MIN_SCORE,
                fallback: None,
            }
        } else if let Some(context) = &opts.context {
            FuzzyMode::Vector {
                vectors: self.embedder.embed_one(context, TaskType::Classification).await.into_iter().collect(),
                min_score: CONTEXT_MIN_SCORE,
                fallback: Some(context.clone()),
            }
        } else {
            FuzzyMode::Scalar
        }
    }

    /// `fuzzy_search` without the noise attached.
    pub(crate) async fn fuzzy_candidates(&self, opts: &SearchOptions) -> Vec<Bean> {
        let (vectors, min_score, fallback) = match self.fuzzy_mode(opts).await {
            FuzzyMode::Vector { vectors, min_score, fallback } => (vectors, min_score, fallback),
            FuzzyMode::Scalar => {
                let result = self
                    .beans
                    .get(
                        &opts.to_filter(),
                        Some(&Projection::include(SEARCH_FIELDS)),
                        Some(&Sort::desc("updated")),
                        opts.top_n as i64,
                    )
                    .await;
                return logged("fuzzy_search", result);
            }
        };

        let result = self
            .beans
            .vector_search(
                &vectors,
                GeneratedField::CategoryEmbeddings.field_name(),
                &[
                    with_filter(opts.to_filter()),
                    with_top_n(opts.top_n),
                    with_min_search_score(min_score),
                    with_projection(Projection::include(SEARCH_FIELDS)),
                ],
            )
            .await;
        let mut beans = logged("fuzzy_search", result);
        beans.sort_by(|a, b| b.search_score.unwrap_or(0.0).total_cmp(&a.search_score.unwrap_or(0.0)));
        beans.truncate(opts.top_n);

        match fallback {
            Some(keywords) if beans.is_empty() => {
                let result = self
                    .beans
                    .text_search(
                        &[keywords],
                        &[
                            with_filter(opts.to_filter()),
                            with_top_n(opts.top_n),
                            with_projection(Projection::include(SEARCH_FIELDS)),
                        ],
                    )
                    .await;
                logged("fuzzy_search", result)
            }
            _ => beans,
        }
    }

    /// Beans mapped to the named nuggets, most recent first.
    pub async fn nugget_search(&self, nuggets: &[String], opts: &SearchOptions) -> Vec<Bean> {
        if nuggets.is_empty() {
            return Vec::new();
        }

        let filter = Filter::is_in("keyphrase", nuggets.iter().map(String::as_str)).and(opts.condition("updated"));
        let found: Vec<BeanNugget> = logged(
            "nugget_search",
            self.nuggets
                .get(
                    &filter,
                    Some(&Projection::include(&["mapped_urls"])),
                    Some(&Sort::desc("match_count")),
                    opts.top_n as i64,
                )
                .await,
        );

        let urls = union_urls(&found);
        if urls.is_empty() {
            return Vec::new();
        }

        let filter = Filter::is_in("url", urls).and(opts.condition("kind"));
        let result = self
            .beans
            .get(
                &filter,
                Some(&Projection::include(SEARCH_FIELDS)),
                Some(&Sort::desc("updated")),
                opts.top_n as i64,
            )
            .await;
        self.attach_noise(logged("nugget_search", result)).await
    }
}

/// Union of the nuggets' mapped urls in first-seen order.
pub(crate) fn union_urls(nuggets: &[BeanNugget]) -> Vec<String> {
    let mut seen = HashSet::new();
    nuggets
        .iter()
        .flat_map(|n| n.mapped_urls.iter())
        .filter(|url| seen.insert(url.as_str()))
        .cloned()
        .collect()
}

pub(crate) fn logged<T>(query: &'static str, result: Result<Vec<T>, SackError>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        tracing::error!(query, error = %e, "Query failed");
        Vec::new()
    })
}
