//! In-process build queue for local runs and tests.

use async_trait::async_trait;
use kiln_core::{
    BuildJob, BuildQueue, BuildResult, Error, JobStatus, ResourceId, Result, WorkerId,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Something that happened to the queue, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued(ResourceId),
    Dequeued(ResourceId),
    Status(ResourceId, JobStatus),
    Result { job_id: ResourceId, success: bool },
    WorkerRegistered(WorkerId),
    WorkerUnregistered(WorkerId),
}

#[derive(Debug)]
struct Entry {
    job: BuildJob,
    status: JobStatus,
    worker_id: Option<WorkerId>,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<ResourceId, Entry>,
    results: HashMap<ResourceId, BuildResult>,
    logs: HashMap<ResourceId, Vec<String>>,
    workers: BTreeSet<String>,
    journal: Vec<QueueEvent>,
    next_seq: u64,
}

impl State {
    /// Highest priority first, then arrival order.
    fn claim(&mut self) -> Option<BuildJob> {
        let id = self
            .entries
            .values()
            .filter(|e| e.status == JobStatus::Queued)
            .min_by_key(|e| (std::cmp::Reverse(e.job.priority), e.seq))
            .map(|e| e.job.id)?;

        let entry = self.entries.get_mut(&id)?;
        entry.status = JobStatus::Building;
        let job = entry.job.clone();
        self.journal.push(QueueEvent::Dequeued(id));
        Some(job)
    }
}

/// Build queue held in process memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, job: BuildJob) {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.journal.push(QueueEvent::Enqueued(job.id));
        state.entries.insert(
            job.id,
            Entry {
                job,
                status: JobStatus::Queued,
                worker_id: None,
                seq,
            },
        );
        drop(state);
        self.arrivals.notify_one();
    }

    /// Jobs waiting to be claimed.
    pub fn queue_length(&self) -> usize {
        self.state()
            .entries
            .values()
            .filter(|e| e.status == JobStatus::Queued)
            .count()
    }

    pub fn status(&self, job_id: ResourceId) -> Option<JobStatus> {
        self.state().entries.get(&job_id).map(|e| e.status)
    }

    /// Worker that last moved the job.
    pub fn assigned_worker(&self, job_id: ResourceId) -> Option<WorkerId> {
        self.state()
            .entries
            .get(&job_id)
            .and_then(|e| e.worker_id.clone())
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.state()
            .entries
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    pub fn result(&self, job_id: ResourceId) -> Option<BuildResult> {
        self.state().results.get(&job_id).cloned()
    }

    pub fn results(&self) -> Vec<BuildResult> {
        self.state().results.values().cloned().collect()
    }

    pub fn logs(&self, job_id: ResourceId) -> Vec<String> {
        self.state().logs.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn workers(&self) -> Vec<String> {
        self.state().workers.iter().cloned().collect()
    }

    /// Every event so far, oldest first.
    pub fn journal(&self) -> Vec<QueueEvent> {
        self.state().journal.clone()
    }

    /// `queued -> cancelled`. Returns whether the job was still queued.
    pub fn cancel(&self, job_id: ResourceId) -> bool {
        let mut state = self.state();
        match state.entries.get_mut(&job_id) {
            Some(entry) if entry.status.can_transition_to(JobStatus::Cancelled) => {
                entry.status = JobStatus::Cancelled;
                state.journal.push(QueueEvent::Status(job_id, JobStatus::Cancelled));
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl BuildQueue for MemoryQueue {
    async fn dequeue(&self, wait: Duration) -> Result<Option<BuildJob>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.state().claim() {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.arrivals.notified()).await;
        }
    }

    async fn update_status(
        &self,
        job_id: ResourceId,
        status: JobStatus,
        worker_id: &WorkerId,
    ) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .entries
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("build job {}", job_id)))?;
        entry.status = status;
        entry.worker_id = Some(worker_id.clone());
        state.journal.push(QueueEvent::Status(job_id, status));
        Ok(())
    }

    async fn set_result(&self, job_id: ResourceId, result: &BuildResult) -> Result<()> {
        let mut state = self.state();
        if !state.entries.contains_key(&job_id) {
            return Err(Error::NotFound(format!("build job {}", job_id)));
        }
        if !state.results.contains_key(&job_id) {
            state.results.insert(job_id, result.clone());
            state.journal.push(QueueEvent::Result {
                job_id,
                success: result.success,
            });
        }
        Ok(())
    }

    async fn append_log(&self, job_id: ResourceId, line: &str) -> Result<()> {
        self.state()
            .logs
            .entry(job_id)
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn register_worker(&self, worker_id: &WorkerId) -> Result<()> {
        let mut state = self.state();
        state.workers.insert(worker_id.as_str().to_string());
        state.journal.push(QueueEvent::WorkerRegistered(worker_id.clone()));
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &WorkerId) -> Result<()> {
        let mut state = self.state();
        state.workers.remove(worker_id.as_str());
        state
            .journal
            .push(QueueEvent::WorkerUnregistered(worker_id.clone()));
        Ok(())
    }
}
