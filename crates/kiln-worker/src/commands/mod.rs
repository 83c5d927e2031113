//! Subcommand implementations.

use anyhow::{Context, Result, ensure};
use kiln_config::WorkerConfig;
use kiln_core::{BuildJob, ResourceId};
use kiln_scheduler::{PgBuildQueue, PgPool, create_pool, run_migrations};
use std::path::Path;
use tracing::{info, warn};

mod run;

pub use run::run;

/// Connection pool sized for the processor plus its log sink.
pub(crate) async fn connect(cfg: &WorkerConfig) -> Result<PgPool> {
    let url = cfg
        .database_url
        .as_deref()
        .context("A database URL is required (--database-url or DATABASE_URL)")?;
    let max_connections = u32::try_from(cfg.build.max_concurrent * 2 + 2).unwrap_or(u32::MAX);

    info!("Connecting to database...");
    let pool = create_pool(url, max_connections).await?;
    info!("Database connected");
    Ok(pool)
}

pub async fn migrate(cfg: &WorkerConfig) -> Result<()> {
    let pool = connect(cfg).await?;
    run_migrations(&pool).await?;
    info!("Migrations applied");
    Ok(())
}

/// Submit a job from a JSON file. `id` is generated when absent.
pub async fn enqueue(cfg: &WorkerConfig, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    let job = parse_job(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))?;

    let pool = connect(cfg).await?;
    let queue = PgBuildQueue::new(pool);
    queue.enqueue(&job).await?;

    println!("{}", job.id);
    info!(job_id = %job.id, repo = %job.git_repo, sha = %job.short_sha(), "Build job enqueued");
    Ok(())
}

pub fn check_config(cfg: &WorkerConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(&cfg.redacted())?;
    println!("{}", json);
    if cfg.database_url.is_none() {
        warn!("No database URL configured; `run` will fail");
    }
    Ok(())
}

fn parse_job(content: &str) -> Result<BuildJob> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;
    if let Some(obj) = value.as_object_mut() {
        obj.entry("id")
            .or_insert_with(|| serde_json::json!(ResourceId::new()));
    }
    let job: BuildJob = serde_json::from_value(value)?;
    ensure!(!job.git_repo.is_empty(), "git_repo must not be empty");
    ensure!(!job.git_sha.is_empty(), "git_sha must not be empty");
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_generates_id() {
        let job = parse_job(
            r#"{
                "release_id": "0191e0a8-7c3e-7000-8000-000000000001",
                "service_id": "0191e0a8-7c3e-7000-8000-000000000002",
                "project_id": "0191e0a8-7c3e-7000-8000-000000000003",
                "git_repo": "https://github.com/acme/api",
                "git_sha": "abc123def456"
            }"#,
        )
        .unwrap();
        assert_eq!(job.git_branch, "");
        assert_eq!(job.priority, 0);
        assert_eq!(job.build_config.dockerfile(), "Dockerfile");
    }

    #[test]
    fn test_parse_job_keeps_given_id() {
        let job = parse_job(
            r#"{
                "id": "0191e0a8-7c3e-7000-8000-0000000000ff",
                "release_id": "0191e0a8-7c3e-7000-8000-000000000001",
                "service_id": "0191e0a8-7c3e-7000-8000-000000000002",
                "project_id": "0191e0a8-7c3e-7000-8000-000000000003",
                "git_repo": "https://github.com/acme/api",
                "git_sha": "abc123def456",
                "priority": 10
            }"#,
        )
        .unwrap();
        assert_eq!(job.id.to_string(), "0191e0a8-7c3e-7000-8000-0000000000ff");
        assert_eq!(job.priority, 10);
    }

    #[test]
    fn test_parse_job_requires_sha() {
        let err = parse_job(
            r#"{
                "release_id": "0191e0a8-7c3e-7000-8000-000000000001",
                "service_id": "0191e0a8-7c3e-7000-8000-000000000002",
                "project_id": "0191e0a8-7c3e-7000-8000-000000000003",
                "git_repo": "https://github.com/acme/api",
                "git_sha": ""
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("git_sha"));
    }
}
