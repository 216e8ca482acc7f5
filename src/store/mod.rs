/// Typed document collections over a pluggable backend
///
/// `Store<T>` gives one collection a typed face: insert-if-absent, batched
/// partial updates, scalar queries, aggregation pipelines, lexical and vector
/// search. Backends only ever see JSON documents, so the same store runs on
/// PostgreSQL (pgvector) or fully in memory.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::SackError;

pub mod eval;
pub mod memory;
pub mod postgres;
pub mod query;

use query::{Condition, Filter, Pipeline, Projection, SearchOption, Sort};

/// Updates are written in transactions of at most this many documents.
pub const UPDATE_BATCH_SIZE: usize = 95;

/// Static description of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    /// Table (or in-memory bucket) name
    pub name: &'static str,
    /// Field the backend keeps unique; inserts of an existing value are skipped
    pub unique_key: Option<&'static str>,
    /// Fields covered by lexical search
    pub text_fields: &'static [&'static str],
}

pub const BEANS: Collection = Collection {
    name: "beans",
    unique_key: Some("url"),
    text_fields: &["title", "summary", "topic", "keywords"],
};

pub const NOISES: Collection = Collection {
    name: "noises",
    unique_key: None,
    text_fields: &[],
};

pub const CONCEPTS: Collection = Collection {
    name: "concepts",
    unique_key: None,
    text_fields: &["keyphrase", "event"],
};

/// Untyped document storage.
///
/// Implementations must be Send + Sync; one backend is shared by every store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Insert documents, skipping any whose unique key already exists.
    /// Returns exactly the inserted documents.
    async fn insert(&self, collection: &Collection, docs: Vec<Value>) -> Result<Vec<Value>, SackError>;

    /// Apply each partial document to the first document matching its filter,
    /// atomically for the whole batch. Returns the number of documents changed.
    async fn update_batch(&self, collection: &Collection, batch: Vec<(Filter, Value)>) -> Result<u64, SackError>;

    async fn find(
        &self,
        collection: &Collection,
        filter: &Filter,
        projection: Option<&Projection>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SackError>;

    async fn aggregate(&self, collection: &Collection, pipeline: &Pipeline) -> Result<Vec<Value>, SackError>;

    /// Delete every matching document and return how many went.
    async fn delete(&self, collection: &Collection, filter: &Filter) -> Result<u64, SackError>;
}

/// How documents of one type are identified and compared.
pub trait Identity<T>: Send + Sync {
    /// Filter selecting the stored copy of `item`
    fn id_of(&self, item: &T) -> Filter;

    fn equals(&self, a: &T, b: &T) -> bool;
}

pub struct Store<T> {
    collection: Collection,
    backend: Arc<dyn Backend>,
    identity: Option<Arc<dyn Identity<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Store {
            collection: self.collection,
            backend: Arc::clone(&self.backend),
            identity: self.identity.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(collection: Collection, backend: Arc<dyn Backend>) -> Self {
        Store { collection, backend, identity: None, _marker: PhantomData }
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity<T>>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Insert items not already stored. Returns the inserted subset.
    pub async fn add(&self, items: Vec<T>) -> Result<Vec<T>, SackError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let fresh = match &self.identity {
            Some(identity) => {
                let lookup = merge_disjunction(items.iter().map(|i| identity.id_of(i)).collect());
                let key_only = self.collection.unique_key.map(|k| Projection::include(&[k]));
                let existing = self.get(&lookup, key_only.as_ref(), None, 0).await?;

                let mut fresh: Vec<T> = Vec::with_capacity(items.len());
                for item in items {
                    let seen = existing.iter().chain(fresh.iter()).any(|e| identity.equals(e, &item));
                    if !seen {
                        fresh.push(item);
                    }
                }
                fresh
            }
            None => items,
        };

        if fresh.is_empty() {
            return Ok(Vec::new());
        }

        let docs = fresh
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let inserted = self.backend.insert(&self.collection, docs).await?;

        tracing::debug!(collection = self.collection.name, count = inserted.len(), "Inserted documents");
        Ok(self.decode(inserted))
    }

    /// Apply `updates[i]` to the first document matching `filters[i]`.
    ///
    /// Runs in batches of `UPDATE_BATCH_SIZE`. A failing batch is logged and skipped;
    /// later batches still run. Returns the number of documents changed.
    pub async fn update<U: Serialize>(&self, updates: &[U], filters: &[Filter]) -> u64 {
        if updates.len() != filters.len() {
            tracing::warn!(
                collection = self.collection.name,
                updates = updates.len(),
                filters = filters.len(),
                "Update and filter counts differ, extra entries ignored"
            );
        }

        let mut pairs: Vec<(Filter, Value)> = Vec::new();
        for (update, filter) in updates.iter().zip(filters) {
            match serde_json::to_value(update) {
                Ok(Value::Object(map)) if map.is_empty() => {}
                Ok(set) => pairs.push((filter.clone(), set)),
                Err(e) => tracing::warn!(
                    collection = self.collection.name,
                    error = %e,
                    "Skipping update that failed to serialize"
                ),
            }
        }

        let mut updated = 0;
        let mut failed_batches = 0;
        for batch in pairs.chunks(UPDATE_BATCH_SIZE) {
            match self.backend.update_batch(&self.collection, batch.to_vec()).await {
                Ok(n) => updated += n,
                Err(e) => {
                    failed_batches += 1;
                    tracing::error!(
                        collection = self.collection.name,
                        batch_size = batch.len(),
                        error = %e,
                        "Update batch failed"
                    );
                }
            }
        }

        if failed_batches > 0 {
            tracing::warn!(collection = self.collection.name, failed_batches, updated, "Updates partially applied");
        }
        updated
    }

    /// Scalar query. `top_n <= 0` means no limit.
    pub async fn get(
        &self,
        filter: &Filter,
        projection: Option<&Projection>,
        sort: Option<&Sort>,
        top_n: i64,
    ) -> Result<Vec<T>, SackError> {
        let limit = (top_n > 0).then_some(top_n as usize);
        let docs = self.backend.find(&self.collection, filter, projection, sort, limit).await?;
        Ok(self.decode(docs))
    }

    /// Run a pipeline; rows may be of any shape the pipeline produces.
    pub async fn aggregate<R: DeserializeOwned>(&self, pipeline: &Pipeline) -> Result<Vec<R>, SackError> {
        let docs = self.backend.aggregate(&self.collection, pipeline).await?;
        Ok(decode_rows(self.collection.name, docs))
    }

    /// Lexical search over the collection's text fields, best matches first.
    pub async fn text_search(&self, terms: &[String], options: &[SearchOption]) -> Result<Vec<T>, SackError> {
        let joined = terms.join(" ");
        if joined.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pipeline = Pipeline::text_search(joined, self.collection.text_fields).apply_all(options);
        self.aggregate(&pipeline).await
    }

    /// One nearest-neighbour query per vector; results concatenated and de-duplicated.
    pub async fn vector_search(
        &self,
        vectors: &[Vec<f32>],
        field: &str,
        options: &[SearchOption],
    ) -> Result<Vec<T>, SackError> {
        let mut results: Vec<T> = Vec::new();
        for vector in vectors.iter().filter(|v| !v.is_empty()) {
            let pipeline = Pipeline::vector_search(vector.clone(), field).apply_all(options);
            let hits: Vec<T> = self.aggregate(&pipeline).await?;
            match &self.identity {
                Some(identity) => {
                    for hit in hits {
                        if !results.iter().any(|r| identity.equals(r, &hit)) {
                            results.push(hit);
                        }
                    }
                }
                None => results.extend(hits),
            }
        }
        Ok(results)
    }

    pub async fn delete(&self, filter: &Filter) -> Result<u64, SackError> {
        self.backend.delete(&self.collection, filter).await
    }

    fn decode(&self, docs: Vec<Value>) -> Vec<T> {
        decode_rows(self.collection.name, docs)
    }
}

fn decode_rows<R: DeserializeOwned>(collection: &str, docs: Vec<Value>) -> Vec<R> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value(doc) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!(collection, error = %e, "Skipping undecodable document");
                None
            }
        })
        .collect()
}

/// `a = x OR a = y OR ...` collapses into `a IN (x, y, ...)`.
fn merge_disjunction(filters: Vec<Filter>) -> Filter {
    let mut name: Option<String> = None;
    let mut values = Vec::with_capacity(filters.len());
    for f in &filters {
        match f {
            Filter::Field(n, Condition::Eq(v)) if name.as_ref().map_or(true, |m| m == n) => {
                name = Some(n.clone());
                values.push(v.clone());
            }
            _ => return Filter::Or(filters),
        }
    }
    match name {
        Some(n) => Filter::Field(n, Condition::In(values)),
        None => Filter::Or(filters),
    }
}
