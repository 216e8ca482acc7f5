/// Backfill of missing derived fields and age-based cleanup

use serde::Serialize;
use serde_json::json;

use super::models::{self, GeneratedField, Kind};
use super::BeanSack;
use crate::embedding::TaskType;
use crate::store::query::{Filter, Projection, Sort};

/// Only beans and nuggets updated this recently are rectified.
pub const RECTIFY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RectifyReport {
    pub beans_updated: u64,
    pub nuggets_embedded: u64,
    pub nuggets_remapped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub beans: u64,
    pub noises: u64,
    pub nuggets: u64,
}

impl BeanSack {
    /// Generate every missing bean field and nugget embedding within the
    /// rectify window, then remap nuggets over the same window.
    /// Each step runs regardless of how the previous one went.
    pub async fn rectify(&self) -> RectifyReport {
        let mut report = RectifyReport::default();

        for field in GeneratedField::ALL {
            let filter = models::updated_in_last(RECTIFY_WINDOW_DAYS)
                .and(Filter::exists(field.field_name(), false))
                .and(Filter::ne("kind", Kind::Channel.as_str()));
            let beans = self
                .beans
                .get(&filter, Some(&Projection::include(&["url", "text"])), Some(&Sort::desc("updated")), 0)
                .await;
            match beans {
                Ok(beans) if beans.is_empty() => {}
                Ok(beans) => report.beans_updated += self.generate_field_for_beans(field, &beans).await,
                Err(e) => tracing::warn!(field = field.field_name(), error = %e, "Failed to load beans to rectify"),
            }
        }

        report.nuggets_embedded = self.embed_missing_nuggets().await;
        report.nuggets_remapped = self.remap_nuggets(RECTIFY_WINDOW_DAYS).await;

        tracing::info!(
            beans_updated = report.beans_updated,
            nuggets_embedded = report.nuggets_embedded,
            nuggets_remapped = report.nuggets_remapped,
            "Rectification finished"
        );
        report
    }

    async fn embed_missing_nuggets(&self) -> u64 {
        let filter = models::updated_in_last(RECTIFY_WINDOW_DAYS).and(Filter::exists("embeddings", false));
        let nuggets = match self
            .nuggets
            .get(&filter, Some(&Projection::include(&["_id", "description"])), None, 0)
            .await
        {
            Ok(nuggets) if nuggets.is_empty() => return 0,
            Ok(nuggets) => nuggets,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load nuggets to rectify");
                return 0;
            }
        };

        let descriptions: Vec<String> = nuggets.iter().map(|n| n.description.clone()).collect();
        let vectors = self.embedder.embed(&descriptions, TaskType::Classification).await;
        if vectors.len() != nuggets.len() {
            tracing::warn!(expected = nuggets.len(), actual = vectors.len(), "Nugget embedding count mismatch");
            return 0;
        }

        let (filters, sets): (Vec<Filter>, Vec<_>) = nuggets
            .iter()
            .zip(vectors)
            .filter(|(_, vector)| !vector.is_empty())
            .filter_map(|(nugget, vector)| {
                let id = nugget.id.as_deref()?;
                Some((Filter::eq("_id", id), json!({ "embeddings": vector })))
            })
            .unzip();
        self.nuggets.update(&sets, &filters).await
    }

    /// Delete beans (except channels), noise and nuggets not updated within `days`.
    pub async fn cleanup(&self, days: i64) -> CleanupReport {
        let cutoff = models::now() - days * 86_400;
        let stale = Filter::lte("updated", cutoff);

        let report = CleanupReport {
            beans: deleted(
                "beans",
                self.beans.delete(&stale.clone().and(Filter::ne("kind", Kind::Channel.as_str()))).await,
            ),
            noises: deleted("noises", self.noises.delete(&stale).await),
            nuggets: deleted("concepts", self.nuggets.delete(&stale).await),
        };

        tracing::info!(
            days,
            beans = report.beans,
            noises = report.noises,
            nuggets = report.nuggets,
            "Cleanup finished"
        );
        report
    }
}

fn deleted(collection: &str, result: Result<u64, crate::errors::SackError>) -> u64 {
    result.unwrap_or_else(|e| {
        tracing::warn!(collection, error = %e, "Cleanup delete failed");
        0
    })
}
