/// Cron-style job ticker
///
/// Expressions have six fields: `sec min hour day-of-month month day-of-week`,
/// evaluated in UTC. Day-of-week accepts names (`Mon`, `Sun`, ...).

use chrono::{DateTime, Utc};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::errors::SackError;

/// A parsed 6-field cron expression.
#[derive(Debug, Clone)]
pub struct Cron {
    expr: String,
    schedule: cron::Schedule,
}

impl FromStr for Cron {
    type Err = SackError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields = expr.split_whitespace().count();
        if fields != 6 {
            return Err(SackError::Config(format!(
                "cron expression '{expr}' must have 6 fields, found {fields}"
            )));
        }
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| SackError::Config(format!("invalid cron expression '{expr}': {e}")))?;

        Ok(Cron {
            expr: expr.trim().to_string(),
            schedule,
        })
    }
}

impl Cron {
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Run `job` at every tick of `cron`. A tick waits for a permit from `gate`, so
/// jobs sharing a gate never overlap; ticks missed while waiting are skipped.
pub fn spawn_job<F, Fut>(name: &'static str, cron: Cron, gate: Arc<Semaphore>, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracing::info!(job = name, schedule = cron.as_str(), "Job scheduled");

    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = cron.next_after(now) else {
                tracing::warn!(job = name, schedule = cron.as_str(), "Schedule has no future runs");
                return;
            };
            tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;

            let _permit = match Arc::clone(&gate).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(job = name, error = %e, "Job gate closed");
                    return;
                }
            };
            tracing::info!(job = name, "Job started");
            job().await;
            tracing::info!(job = name, "Job finished");
        }
    })
}
