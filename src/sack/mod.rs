/// The bean sack: stores, enrichment clients and background work
///
/// `BeanSack` is built once at startup and shared behind an `Arc`. Ingest,
/// rectification and cleanup live in the submodules; retrieval lives in
/// `crate::search`. Detached background tasks (nugget generation, remap) share
/// a semaphore that bounds their parallelism.

pub mod indexer;
pub mod models;
pub mod noise;
pub mod rectify;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::embedding::Embedder;
use crate::errors::SackError;
use crate::extraction::Extractor;
use crate::store::{Backend, Store, BEANS, CONCEPTS, NOISES};
use crate::tokens::TokenCounter;

use models::{Bean, BeanNugget, MediaNoise, UrlIdentity};

pub use indexer::IngestReport;
pub use rectify::{CleanupReport, RectifyReport};

pub struct BeanSack {
    pub(crate) beans: Store<Bean>,
    pub(crate) noises: Store<MediaNoise>,
    pub(crate) nuggets: Store<BeanNugget>,
    pub(crate) embedder: Embedder,
    pub(crate) extractor: Extractor,
    pub(crate) tokens: TokenCounter,
    background: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
}

impl BeanSack {
    pub fn new(
        backend: Arc<dyn Backend>,
        embedder: Embedder,
        extractor: Extractor,
        tokens: TokenCounter,
        background_tasks: usize,
    ) -> Result<Self, SackError> {
        if background_tasks == 0 {
            return Err(SackError::validation("background_tasks", "at least one background task is required"));
        }

        Ok(BeanSack {
            beans: Store::new(BEANS, Arc::clone(&backend)).with_identity(Arc::new(UrlIdentity)),
            noises: Store::new(NOISES, Arc::clone(&backend)),
            nuggets: Store::new(CONCEPTS, backend),
            embedder,
            extractor,
            tokens,
            background: Arc::new(Semaphore::new(background_tasks)),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of background tasks spawned and not yet finished.
    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Wait until all in-flight background tasks have completed (success or failure).
    /// Polls the pending count every 100ms.
    pub async fn flush(&self) {
        loop {
            let pending = self.pending_tasks();
            if pending == 0 {
                break;
            }
            tracing::debug!(pending, "Waiting for background tasks to finish");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Detach `task`. It runs once a background permit is free; failures stay inside it.
    pub(crate) fn spawn_background<F>(&self, job: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.background);
        let pending = PendingGuard::new(Arc::clone(&self.pending));

        tokio::spawn(async move {
            let _pending = pending;
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    tracing::debug!(job, "Background task started");
                    task.await;
                }
                Err(e) => tracing::warn!(job, error = %e, "Background task dropped"),
            }
        });
    }
}

/// Counts a task as pending until dropped, even if the task panics.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        PendingGuard(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
