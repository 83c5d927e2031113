//! The cluster seam: what the pipeline needs from a container-orchestration
//! cluster.

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job;
use kiln_core::Result;

/// A state change observed on a watched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The job exists but has not reached a terminal condition.
    Progress,
    /// `Complete=True`.
    Complete,
    /// `Failed=True`, with the condition's message.
    Failed(String),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress)
    }
}

/// Events for one job. Ends (or yields an error) if the watch breaks.
pub type JobEventStream = BoxStream<'static, Result<JobEvent>>;

/// Container output, one line per item.
pub type LogLines = BoxStream<'static, Result<String>>;

/// Operations on cluster jobs. Implementations are shared across concurrent
/// builds.
#[async_trait]
pub trait JobCluster: Send + Sync {
    /// Submit a job.
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Watch the job named `name`.
    async fn watch_job(&self, name: &str) -> Result<JobEventStream>;

    /// Name of the first pod created for `job_name`, if any.
    async fn find_pod(&self, job_name: &str) -> Result<Option<String>>;

    /// Output of `container` in `pod`.
    async fn pod_logs(&self, pod: &str, container: &str) -> Result<LogLines>;
}

/// Interpret a job's status conditions.
pub fn job_event(job: &Job) -> JobEvent {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();

    for condition in conditions {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobEvent::Complete,
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "no message".to_string());
                return JobEvent::Failed(message);
            }
            _ => {}
        }
    }

    JobEvent::Progress
}
