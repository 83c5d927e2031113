//! Log sink that appends build output to the queue.

use async_trait::async_trait;
use kiln_core::{BuildQueue, LogSink, ResourceId};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Appends each line to the job's queue log, dropping lines the queue does
/// not accept within the timeout.
#[derive(Clone)]
pub struct QueueLogSink {
    queue: Arc<dyn BuildQueue>,
    timeout: Duration,
}

impl QueueLogSink {
    pub fn new(queue: Arc<dyn BuildQueue>) -> Self {
        Self {
            queue,
            timeout: DEFAULT_APPEND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LogSink for QueueLogSink {
    async fn append(&self, job_id: ResourceId, line: &str) {
        match tokio::time::timeout(self.timeout, self.queue.append_log(job_id, line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Failed to append build log"),
            Err(_) => warn!(job_id = %job_id, "Timed out appending build log"),
        }
    }
}
