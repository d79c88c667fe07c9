//! Bounded-concurrency executor for cache regeneration tasks.
//!
//! Submission never blocks: every task is spawned immediately and then waits
//! for one of `max_workers` permits. Cancelling the pool's token stops tasks
//! that have not started yet; running tasks finish normally.

use crate::errors::PipelineResult;
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Counts after a pool has been drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
}

impl WorkerPool {
    /// `max_workers` of zero is treated as one.
    pub fn new(max_workers: usize, cancellation_token: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            cancellation_token,
            tasks: JoinSet::new(),
        }
    }

    /// Queue `task`. Its error is logged under `label` and never escapes the
    /// pool.
    pub fn submit<F>(&mut self, label: String, task: F)
    where
        F: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let cancellation_token = self.cancellation_token.clone();

        self.tasks.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    debug!(task = %label, "pool cancelled before task started");
                    return TaskOutcome::Cancelled;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutcome::Cancelled,
                },
            };

            match task.await {
                Ok(()) => TaskOutcome::Completed,
                Err(e) => {
                    warn!(task = %label, error = %e, "task failed, skipping");
                    TaskOutcome::Failed
                }
            }
        });
    }

    pub fn queued(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every submitted task.
    pub async fn drain(mut self) -> PoolReport {
        let mut report = PoolReport::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(TaskOutcome::Completed) => report.completed += 1,
                Ok(TaskOutcome::Failed) => report.failed += 1,
                Ok(TaskOutcome::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    error!(error = %e, "pool task panicked");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
