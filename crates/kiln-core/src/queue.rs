//! Queue and log sink traits.
//!
//! The queue is an external collaborator shared by every worker. Dequeue must
//! be atomic across workers; everything else is fire-and-forget from the
//! worker's point of view.

use async_trait::async_trait;
use std::time::Duration;

use crate::{BuildJob, BuildResult, JobStatus, ResourceId, Result, WorkerId};

/// Shared, multi-worker-safe build queue.
#[async_trait]
pub trait BuildQueue: Send + Sync {
    /// Claim the next job, waiting up to `wait` for one to arrive.
    ///
    /// No two callers, in this process or any other, ever receive the same job.
    async fn dequeue(&self, wait: Duration) -> Result<Option<BuildJob>>;

    /// Record a status transition and the worker that made it.
    async fn update_status(
        &self,
        job_id: ResourceId,
        status: JobStatus,
        worker_id: &WorkerId,
    ) -> Result<()>;

    /// Persist the terminal result. The first stored result is kept.
    async fn set_result(&self, job_id: ResourceId, result: &BuildResult) -> Result<()>;

    /// Append one line to the job's build log.
    async fn append_log(&self, job_id: ResourceId, line: &str) -> Result<()>;

    /// Mark a worker as active.
    async fn register_worker(&self, worker_id: &WorkerId) -> Result<()>;

    /// Remove a worker from the active set.
    async fn unregister_worker(&self, worker_id: &WorkerId) -> Result<()>;
}

/// Destination for per-job build progress lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, job_id: ResourceId, line: &str);
}
