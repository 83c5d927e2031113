//! Job processor: admission control, per-job supervision and shutdown.

use futures::FutureExt;
use kiln_config::WorkerConfig;
use kiln_core::{
    BuildContext, BuildJob, BuildQueue, BuildResult, ImageBuilder, JobStatus, Result, WorkerId,
};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackNotifier;

/// Processor tunables.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Upper bound on builds in flight.
    pub max_concurrent: usize,
    /// Longest a single dequeue waits for work.
    pub poll_interval: Duration,
    /// Pause after a failed dequeue.
    pub dequeue_backoff: Duration,
    /// Wall-clock cap for one build.
    pub build_timeout: Duration,
    /// Ceiling on waiting for in-flight builds at shutdown.
    pub shutdown_timeout: Duration,
    pub unregister_timeout: Duration,
    pub callback_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ProcessorConfig {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            max_concurrent: cfg.build.max_concurrent.max(1),
            poll_interval: cfg.worker.poll_interval,
            dequeue_backoff: cfg.worker.dequeue_backoff,
            build_timeout: cfg.build.timeout,
            shutdown_timeout: cfg.worker.shutdown_timeout,
            unregister_timeout: cfg.worker.unregister_timeout,
            callback_timeout: cfg.callback.timeout,
        }
    }
}

/// Point-in-time view of the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub worker_id: String,
    pub max_concurrent: usize,
    pub active_builds: usize,
    pub available_slots: usize,
}

/// What each build task needs; cloned into the task.
#[derive(Clone)]
struct Shared {
    worker_id: WorkerId,
    queue: Arc<dyn BuildQueue>,
    builder: Arc<dyn ImageBuilder>,
    notifier: Option<CallbackNotifier>,
    build_timeout: Duration,
    callback_timeout: Duration,
    /// Cancelled once the drain ceiling is reached.
    abort: CancellationToken,
}

/// Pulls build jobs from the queue and runs at most `max_concurrent` of them
/// at a time.
pub struct Processor {
    shared: Shared,
    config: ProcessorConfig,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Processor {
    pub fn new(
        worker_id: WorkerId,
        queue: Arc<dyn BuildQueue>,
        builder: Arc<dyn ImageBuilder>,
        config: ProcessorConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            shared: Shared {
                worker_id,
                queue,
                builder,
                notifier: None,
                build_timeout: config.build_timeout,
                callback_timeout: config.callback_timeout,
                abort: CancellationToken::new(),
            },
            config: ProcessorConfig {
                max_concurrent,
                ..config
            },
            slots: Arc::new(Semaphore::new(max_concurrent)),
            tracker: TaskTracker::new(),
        }
    }

    /// Post results to each job's callback URL.
    pub fn with_notifier(mut self, notifier: CallbackNotifier) -> Self {
        self.shared.notifier = Some(notifier);
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.worker_id
    }

    pub fn stats(&self) -> ProcessorStats {
        let available = self.slots.available_permits();
        ProcessorStats {
            worker_id: self.shared.worker_id.to_string(),
            max_concurrent: self.config.max_concurrent,
            active_builds: self.config.max_concurrent.saturating_sub(available),
            available_slots: available,
        }
    }

    /// Process jobs until `shutdown` is cancelled, then drain and unregister.
    ///
    /// Queue failures never stop the loop; registration included.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self
            .shared
            .queue
            .register_worker(&self.shared.worker_id)
            .await
        {
            warn!(worker_id = %self.shared.worker_id, error = %e, "Failed to register worker");
        }

        info!(
            worker_id = %self.shared.worker_id,
            max_concurrent = self.config.max_concurrent,
            builder = self.shared.builder.name(),
            "Build worker started"
        );

        while let Some(permit) = self.acquire_slot(&shutdown).await {
            match self.shared.queue.dequeue(self.config.poll_interval).await {
                Ok(Some(job)) => self.dispatch(job, permit),
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Failed to dequeue build job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.dequeue_backoff) => {}
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Wait for a free slot, or `None` once shutdown is requested.
    async fn acquire_slot(&self, shutdown: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        if shutdown.is_cancelled() {
            return None;
        }
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Some(permit);
        }
        tokio::select! {
            _ = shutdown.cancelled() => None,
            permit = self.slots.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Run one job on its own task. The permit is released when the task
    /// ends, however it ends.
    fn dispatch(&self, job: BuildJob, permit: OwnedSemaphorePermit) {
        let shared = self.shared.clone();
        let ctx = BuildContext::new(&shared.abort, shared.build_timeout);
        self.tracker.spawn(async move {
            let _permit = permit;
            shared.process(job, ctx).await;
        });
    }

    async fn drain(&self) {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight builds to finish");
        }

        if timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, builds may have been interrupted"
            );
            self.shared.abort.cancel();
        }

        let worker_id = &self.shared.worker_id;
        match timeout(
            self.config.unregister_timeout,
            self.shared.queue.unregister_worker(worker_id),
        )
        .await
        {
            Ok(Ok(())) => info!(worker_id = %worker_id, "Build worker stopped"),
            Ok(Err(e)) => warn!(worker_id = %worker_id, error = %e, "Failed to unregister worker"),
            Err(_) => warn!(worker_id = %worker_id, "Timed out unregistering worker"),
        }
    }
}

impl Shared {
    async fn process(&self, job: BuildJob, ctx: BuildContext) {
        let job_id = job.id;
        info!(
            job_id = %job_id,
            release_id = %job.release_id,
            repo = %job.git_repo,
            sha = %job.short_sha(),
            "Processing build job"
        );

        if let Err(e) = self
            .queue
            .update_status(job_id, JobStatus::Building, &self.worker_id)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to mark job as building");
        }

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.builder.execute(&job, &ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = format!("build panicked: {}", panic_message(panic.as_ref()));
                error!(job_id = %job_id, error = %message, "Build task panicked");
                BuildResult::for_job(&job).fail(message, started.elapsed().as_secs_f64())
            }
        };

        if let Err(e) = self.queue.set_result(job_id, &result).await {
            error!(job_id = %job_id, error = %e, "Failed to store build result");
        }

        let status = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if let Err(e) = self
            .queue
            .update_status(job_id, status, &self.worker_id)
            .await
        {
            error!(job_id = %job_id, status = %status, error = %e, "Failed to update job status");
        }

        if result.success {
            info!(
                job_id = %job_id,
                image = result.image_uri.as_deref().unwrap_or_default(),
                duration_secs = result.duration_secs,
                "Build completed"
            );
        } else {
            warn!(
                job_id = %job_id,
                error = result.error_message.as_deref().unwrap_or_default(),
                duration_secs = result.duration_secs,
                "Build failed"
            );
        }

        if let Some(url) = job.callback_url.as_deref() {
            self.send_callback(url, &result).await;
        }
    }

    async fn send_callback(&self, url: &str, result: &BuildResult) {
        let Some(notifier) = &self.notifier else {
            debug!(job_id = %result.job_id, "No callback notifier configured");
            return;
        };

        let ctx = BuildContext::new(&self.abort, self.callback_timeout);
        match ctx.run(notifier.notify(url, result)).await {
            Ok(()) => debug!(job_id = %result.job_id, "Callback sent"),
            Err(e) => warn!(job_id = %result.job_id, url = %url, error = %e, "Callback failed"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
