/// Query envelope and retrieval over the bean sack
///
/// `SearchOptions` carries the scalar conditions, result size and the optional
/// search inputs (texts, embeddings, context). The query functions in
/// `retrieval` and `trending` decide the search mode from which inputs are set.

pub mod retrieval;
pub mod trending;

use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::sack::models::Kind;
use crate::store::query::{Condition, Filter};

pub use retrieval::FuzzyMode;

pub const DEFAULT_TOPN: usize = 10;
pub const MAX_TOPN: usize = 100;
pub const MIN_WINDOW: i64 = 1;
pub const MAX_WINDOW: i64 = 28;

/// Fields returned by search-style queries.
pub const SEARCH_FIELDS: &[&str] = &[
    "url", "updated", "source", "title", "kind", "author", "created", "summary", "keywords", "topic", "search_score",
];

/// Fields returned by plain retrieval.
pub const RETRIEVE_FIELDS: &[&str] = &[
    "url", "updated", "source", "title", "kind", "author", "created", "text", "keywords", "summary", "topic",
    "category_embeddings",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub scalar_filter: BTreeMap<String, Condition>,
    pub top_n: usize,
    pub search_texts: Vec<String>,
    pub search_embeddings: Vec<Vec<f32>>,
    pub context: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            scalar_filter: BTreeMap::new(),
            top_n: DEFAULT_TOPN,
            search_texts: Vec::new(),
            search_embeddings: Vec::new(),
            context: None,
        }
    }
}

impl SearchOptions {
    pub fn new() -> Self {
        SearchOptions::default()
    }

    /// `updated >= now - days`, with `days` clamped to [1, 28].
    pub fn with_time_window(mut self, days: i64) -> Self {
        let days = days.clamp(MIN_WINDOW, MAX_WINDOW);
        let since = (Utc::now() - Duration::days(days)).timestamp();
        self.scalar_filter.insert("updated".to_string(), Condition::Gte(Value::from(since)));
        self
    }

    /// Non-positive means the default, anything above 100 means 100.
    pub fn with_top_n(mut self, top_n: i64) -> Self {
        self.top_n = if top_n <= 0 { DEFAULT_TOPN } else { (top_n as usize).min(MAX_TOPN) };
        self
    }

    pub fn with_kinds(mut self, kinds: &[Kind]) -> Self {
        if !kinds.is_empty() {
            let values = kinds.iter().map(|k| Value::from(k.as_str())).collect();
            self.scalar_filter.insert("kind".to_string(), Condition::In(values));
        }
        self
    }

    pub fn with_urls(mut self, urls: &[String]) -> Self {
        if !urls.is_empty() {
            let values = urls.iter().map(|u| Value::from(u.as_str())).collect();
            self.scalar_filter.insert("url".to_string(), Condition::In(values));
        }
        self
    }

    pub fn with_search_texts(mut self, texts: Vec<String>) -> Self {
        self.search_texts = texts.into_iter().filter(|t| !t.trim().is_empty()).collect();
        self
    }

    pub fn with_search_embeddings(mut self, embeddings: Vec<Vec<f32>>) -> Self {
        self.search_embeddings = embeddings.into_iter().filter(|e| !e.is_empty()).collect();
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context.filter(|c| !c.trim().is_empty());
        self
    }

    /// Conjunction of every scalar condition.
    pub fn to_filter(&self) -> Filter {
        self.scalar_filter
            .iter()
            .fold(Filter::All, |acc, (name, cond)| acc.and(Filter::field(name, cond.clone())))
    }

    /// The condition on one field, or `Filter::All` when there is none.
    pub fn condition(&self, name: &str) -> Filter {
        self.scalar_filter
            .get(name)
            .map_or(Filter::All, |cond| Filter::field(name, cond.clone()))
    }
}
