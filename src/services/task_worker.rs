//! Outbox poller: claims due tasks, runs their reconciliation and records
//! the outcome.
//!
//! Delivery is at-least-once. A task is deleted only after its body
//! succeeds; failures are re-scheduled with exponential backoff and
//! discarded after `max_attempts`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerConfig,
    db::tasks,
    errors::{ServiceError, ServiceResult},
    models::task::TaskRecord,
    services::reconciler::ExpiryReconciler,
};

/// Counts from one [`TaskWorker::run_due`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub completed: usize,
    pub retried: usize,
    pub discarded: usize,
}

impl RunStats {
    pub fn is_empty(&self) -> bool {
        self.completed + self.retried + self.discarded == 0
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// clamped to `max`.
pub fn retry_delay(config: &WorkerConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay)
}

fn at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone)]
pub struct TaskWorker {
    db: Arc<SqlitePool>,
    reconciler: ExpiryReconciler,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(db: Arc<SqlitePool>, reconciler: ExpiryReconciler, config: WorkerConfig) -> Self {
        Self {
            db,
            reconciler,
            config,
        }
    }

    /// Run every task due at `now`, up to one batch.
    pub async fn run_due(&self, now: DateTime<Utc>) -> ServiceResult<RunStats> {
        const OP: &str = "TaskWorker::run_due";
        let db_err = |err| ServiceError::database(OP, err);

        let due = tasks::due(&*self.db, now, self.config.batch_size)
            .await
            .map_err(db_err)?;

        let mut stats = RunStats::default();
        for task in due {
            if !tasks::lease(&*self.db, &task, at(now, self.config.lease))
                .await
                .map_err(db_err)?
            {
                debug!(task_id = %task.id, "task claimed by another worker");
                continue;
            }

            let attempt = u32::try_from(task.attempts + 1).unwrap_or(u32::MAX);
            match self.execute(&task).await {
                Ok(()) => {
                    tasks::complete(&*self.db, task.id).await.map_err(db_err)?;
                    stats.completed += 1;
                }
                Err(Failure::Permanent(reason)) => {
                    error!(task_id = %task.id, kind = %task.kind, %reason, "discarding task");
                    tasks::discard(&*self.db, task.id, &reason).await.map_err(db_err)?;
                    stats.discarded += 1;
                }
                Err(Failure::Transient(reason)) if attempt >= self.config.max_attempts => {
                    error!(task_id = %task.id, kind = %task.kind, attempt, %reason, "task exhausted its attempts");
                    tasks::discard(&*self.db, task.id, &reason).await.map_err(db_err)?;
                    stats.discarded += 1;
                }
                Err(Failure::Transient(reason)) => {
                    let run_at = at(now, retry_delay(&self.config, attempt));
                    warn!(task_id = %task.id, kind = %task.kind, attempt, %run_at, %reason, "task failed, retrying");
                    tasks::retry_at(&*self.db, task.id, run_at, &reason)
                        .await
                        .map_err(db_err)?;
                    stats.retried += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn execute(&self, task: &TaskRecord) -> Result<(), Failure> {
        let payload = task
            .decode_payload()
            .map_err(|err| Failure::Permanent(format!("undecodable payload: {err}")))?;
        let outcome = self
            .reconciler
            .run(&payload)
            .await
            .map_err(|err| Failure::Transient(err.to_string()))?;
        debug!(task_id = %task.id, ?outcome, "task finished");
        Ok(())
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval = ?self.config.poll_interval, "task worker started");

        while !*shutdown.borrow() {
            let idle = match self.run_due(Utc::now()).await {
                Ok(stats) => stats.is_empty(),
                Err(err) => {
                    error!(error = %err, "task poll failed");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("task worker stopped");
    }
}

enum Failure {
    /// Retrying cannot help.
    Permanent(String),
    Transient(String),
}
