/// Source collectors and the scheduled collect-then-rectify job

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::SackError;
use crate::sack::models::Bean;
use crate::sack::{BeanSack, IngestReport, RectifyReport};

/// A source of raw beans (a sitemap crawler, a social feed reader, ...).
#[async_trait]
pub trait Collector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Beans published since the last run. Enrichment is left to the sack.
    async fn collect(&self) -> Result<Vec<Bean>, SackError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub ingested: IngestReport,
    pub failed_collectors: usize,
    pub rectified: RectifyReport,
}

/// Run every collector in turn, ingest what each returns, then rectify once.
/// A failing collector is logged and skipped.
pub async fn run_collection(sack: &Arc<BeanSack>, collectors: &[Arc<dyn Collector>]) -> CollectionReport {
    let mut report = CollectionReport::default();

    for collector in collectors {
        let beans = match collector.collect().await {
            Ok(beans) => beans,
            Err(e) => {
                tracing::warn!(collector = collector.name(), error = %e, "Collection failed");
                report.failed_collectors += 1;
                continue;
            }
        };
        tracing::info!(collector = collector.name(), count = beans.len(), "Collected beans");

        match sack.add_beans(beans).await {
            Ok(ingested) => {
                report.ingested.accepted += ingested.accepted;
                report.ingested.inserted += ingested.inserted;
                report.ingested.noises += ingested.noises;
            }
            Err(e) => {
                tracing::error!(collector = collector.name(), error = %e, "Ingest failed");
                report.failed_collectors += 1;
            }
        }
    }

    report.rectified = sack.rectify().await;
    tracing::info!(
        inserted = report.ingested.inserted,
        failed_collectors = report.failed_collectors,
        beans_updated = report.rectified.beans_updated,
        "Collection cycle finished"
    );
    report
}
