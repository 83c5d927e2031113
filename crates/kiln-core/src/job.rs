//! Build job and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, ResourceId};

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DEFAULT_CONTEXT: &str = ".";

/// A request to build one commit into an image.
///
/// Everything except status and worker assignment is fixed once the job is
/// created; those two live in the queue, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: ResourceId,
    pub release_id: ResourceId,
    pub service_id: ResourceId,
    pub project_id: ResourceId,
    /// Human-readable service name, used as the image repository when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub git_repo: String,
    pub git_sha: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BuildJob {
    /// Commit SHA truncated to eight characters.
    pub fn short_sha(&self) -> &str {
        self.git_sha.get(..8).unwrap_or(&self.git_sha)
    }
}

/// How the image is built from the source tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Path to the Dockerfile, relative to the context.
    #[serde(default)]
    pub dockerfile: String,
    /// Build context subdirectory.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// Multi-stage build target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl BuildConfig {
    pub fn dockerfile(&self) -> &str {
        non_empty_or(&self.dockerfile, DEFAULT_DOCKERFILE)
    }

    pub fn context(&self) -> &str {
        non_empty_or(&self.context, DEFAULT_CONTEXT)
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref().filter(|t| !t.is_empty())
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() { default } else { trimmed }
}

/// Lifecycle of a job as recorded by the queue.
///
/// `queued -> building -> completed | failed`; `cancelled` only from `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Building,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Building => "building",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Building)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Building, JobStatus::Completed)
                | (JobStatus::Building, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "building" => Ok(JobStatus::Building),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// Terminal outcome of a build, produced once per job.
///
/// `image_uri` is set as soon as the destination tag is known, so a failed
/// result may still name an image that was pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub job_id: ResourceId,
    pub release_id: ResourceId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbom_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_signature: Option<String>,
}

impl BuildResult {
    /// An in-progress result echoing the job's identifiers.
    pub fn for_job(job: &BuildJob) -> Self {
        Self {
            job_id: job.id,
            release_id: job.release_id,
            success: false,
            error_message: None,
            duration_secs: 0.0,
            image_uri: None,
            image_digest: None,
            sbom: None,
            sbom_format: None,
            image_signature: None,
        }
    }

    pub fn succeed(mut self, duration_secs: f64) -> Self {
        self.success = true;
        self.error_message = None;
        self.duration_secs = duration_secs;
        self
    }

    pub fn fail(mut self, message: impl Into<String>, duration_secs: f64) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self.duration_secs = duration_secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_json() -> &'static str {
        r#"{
            "id": "0190a7c4-0000-7000-8000-000000000001",
            "release_id": "0190a7c4-0000-7000-8000-000000000002",
            "service_id": "0190a7c4-0000-7000-8000-000000000003",
            "project_id": "0190a7c4-0000-7000-8000-000000000004",
            "git_repo": "https://github.com/acme/api",
            "git_sha": "abc123def456",
            "git_branch": "main"
        }"#
    }

    #[test]
    fn test_build_config_defaults() {
        let job: BuildJob = serde_json::from_str(job_json()).unwrap();
        assert_eq!(job.build_config.dockerfile(), "Dockerfile");
        assert_eq!(job.build_config.context(), ".");
        assert!(job.build_config.target().is_none());
        assert!(job.callback_url.is_none());
        assert_eq!(job.priority, 0);
    }

    #[test]
    fn test_short_sha() {
        let mut job: BuildJob = serde_json::from_str(job_json()).unwrap();
        assert_eq!(job.short_sha(), "abc123de");
        job.git_sha = "abc".to_string();
        assert_eq!(job.short_sha(), "abc");
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Building));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Building.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Building.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Building));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Building,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_failed_result_carries_message() {
        let job: BuildJob = serde_json::from_str(job_json()).unwrap();
        let result = BuildResult::for_job(&job).fail("boom", 1.5);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("sbom").is_none());
    }
}
