/// In-process backend for `memory://`
///
/// Documents live in per-collection vectors behind a mutex. Every query runs
/// through the evaluator in `eval`. Nothing survives a restart.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::eval;
use super::query::{Filter, Pipeline, Projection, Sort};
use super::{Backend, Collection};
use crate::errors::SackError;

#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<&'static str, Vec<Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    fn with_docs<R>(&self, collection: &Collection, f: impl FnOnce(&mut Vec<Value>) -> R) -> Result<R, SackError> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| SackError::Storage("memory backend lock poisoned".to_string()))?;
        Ok(f(guard.entry(collection.name).or_default()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert(&self, collection: &Collection, docs: Vec<Value>) -> Result<Vec<Value>, SackError> {
        self.with_docs(collection, |stored| {
            let mut inserted = Vec::with_capacity(docs.len());
            for doc in docs {
                if let Some(key) = collection.unique_key {
                    let value = eval::get_field(&doc, key);
                    let taken = value.is_some()
                        && stored.iter().any(|d| eval::get_field(d, key) == value);
                    if taken {
                        continue;
                    }
                }
                stored.push(doc.clone());
                inserted.push(doc);
            }
            inserted
        })
    }

    async fn update_batch(&self, collection: &Collection, batch: Vec<(Filter, Value)>) -> Result<u64, SackError> {
        self.with_docs(collection, |stored| {
            let mut changed = 0;
            for (filter, set) in batch {
                let target = stored.iter_mut().find(|d| eval::matches(d, &filter));
                if let (Some(Value::Object(doc)), Value::Object(set)) = (target, set) {
                    doc.extend(set);
                    changed += 1;
                }
            }
            changed
        })
    }

    async fn find(
        &self,
        collection: &Collection,
        filter: &Filter,
        projection: Option<&Projection>,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SackError> {
        let mut docs = self.with_docs(collection, |stored| {
            stored.iter().filter(|d| eval::matches(d, filter)).cloned().collect::<Vec<_>>()
        })?;
        if let Some(sort) = sort {
            eval::sort_docs(&mut docs, sort);
        }
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(match projection {
            Some(p) => docs.into_iter().map(|d| eval::project(d, p)).collect(),
            None => docs,
        })
    }

    async fn aggregate(&self, collection: &Collection, pipeline: &Pipeline) -> Result<Vec<Value>, SackError> {
        let docs = self.with_docs(collection, |stored| stored.clone())?;
        Ok(eval::execute(&pipeline.stages, docs))
    }

    async fn delete(&self, collection: &Collection, filter: &Filter) -> Result<u64, SackError> {
        self.with_docs(collection, |stored| {
            let before = stored.len();
            stored.retain(|d| !eval::matches(d, filter));
            (before - stored.len()) as u64
        })
    }
}
