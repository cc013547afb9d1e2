//! Bounded background worker pool.
//!
//! Short I/O-bound jobs (sample write-back, external search queries, mail
//! delivery) run here instead of on the request path. The pool is a fixed
//! number of permits; a job waits for a permit before it starts.
//!
//! Jobs return `Result<T, TaskError>`. A supervisor task logs every `Err`
//! and every panic and hands the caller `None` instead, so no failure
//! crosses the pool boundary.
//!
//! Every job also runs under a ceiling. A job that hangs past it is
//! dropped and its permit released, so a stuck relay or search call
//! cannot starve the jobs queued behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::metrics::AppMetrics;

/// Default number of concurrently running jobs.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Longest any single job may hold a permit.
pub const DEFAULT_TASK_CEILING: Duration = Duration::from_secs(30);

/// Failure of a background job. Logged by the supervisor, never surfaced.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("worker pool is shut down")]
    Shutdown,
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    task_ceiling: Duration,
    metrics: Option<Arc<AppMetrics>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            task_ceiling: DEFAULT_TASK_CEILING,
            metrics: None,
        }
    }

    pub fn with_task_ceiling(mut self, ceiling: Duration) -> Self {
        self.task_ceiling = ceiling;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` on the pool. The handle resolves to `None` when the task
    /// failed, panicked or outlived the ceiling; dropping the handle does
    /// not cancel the task.
    pub fn spawn<T, F>(&self, label: &'static str, task: F) -> JoinHandle<Option<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let ceiling = self.task_ceiling;
        let job = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| TaskError::Shutdown)?;
            tokio::time::timeout(ceiling, task)
                .await
                .map_err(|_| TaskError::Timeout(ceiling))?
        });

        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match job.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(err)) => {
                    tracing::warn!(task = label, "Background task failed: {}", err);
                    if let Some(metrics) = metrics {
                        metrics.pool_task_failures_total.inc();
                    }
                    None
                }
                Err(join_err) => {
                    tracing::error!(task = label, "Background task aborted: {}", join_err);
                    if let Some(metrics) = metrics {
                        metrics.pool_task_failures_total.inc();
                    }
                    None
                }
            }
        })
    }

    /// Run `task` and ignore its result.
    pub fn fire_and_forget<T, F>(&self, label: &'static str, task: F)
    where
        T: Send + 'static,
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        drop(self.spawn(label, task));
    }

    /// Run `task` and wait for it at most `limit`.
    ///
    /// On expiry the caller gets `None` right away while the task keeps
    /// running; whatever side effects it has still happen later.
    pub async fn run_with_timeout<T, F>(
        &self,
        label: &'static str,
        limit: Duration,
        task: F,
    ) -> Option<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let handle = self.spawn(label, task);
        await_with_timeout(label, limit, handle).await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

/// Wait on a pool handle for at most `limit`, falling back to `None`.
pub async fn await_with_timeout<T>(
    label: &'static str,
    limit: Duration,
    handle: impl Future<Output = Result<Option<T>, tokio::task::JoinError>>,
) -> Option<T> {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            tracing::error!(task = label, "Supervisor task failed: {}", err);
            None
        }
        Err(_) => {
            tracing::debug!(task = label, "Still running after {:?}, using fallback", limit);
            None
        }
    }
}
