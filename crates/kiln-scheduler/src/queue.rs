//! Build queue backed by PostgreSQL.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED`, so any number of workers
//! can dequeue concurrently without two of them receiving the same job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::{
    BuildJob, BuildQueue, BuildResult, Error, JobStatus, ResourceId, Result, WorkerId,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// How often an empty queue is re-polled while a dequeue waits.
const POLL_STEP: Duration = Duration::from_millis(500);

/// Create a connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(queue_err)
}

/// Apply the embedded queue migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Queue(format!("migration failed: {}", e)))?;
    Ok(())
}

fn queue_err(e: sqlx::Error) -> Error {
    Error::Queue(e.to_string())
}

/// A job with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: BuildJob,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    payload: Json<BuildJob>,
    status: String,
    worker_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            job: row.payload.0,
            status: row.status.parse()?,
            worker_id: row.worker_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// Build queue backed by PostgreSQL.
#[derive(Clone)]
pub struct PgBuildQueue {
    pool: PgPool,
}

impl PgBuildQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Add a job in the `queued` state.
    pub async fn enqueue(&self, job: &BuildJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_jobs
                (id, release_id, service_id, project_id, payload, status, priority, created_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.release_id.as_uuid())
        .bind(job.service_id.as_uuid())
        .bind(job.project_id.as_uuid())
        .bind(Json(job))
        .bind(job.priority)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        info!(job_id = %job.id, priority = job.priority, "Enqueued build job");
        Ok(())
    }

    /// Claim the next queued job, if any.
    async fn claim(&self) -> Result<Option<BuildJob>> {
        let payload: Option<Json<BuildJob>> = sqlx::query_scalar(
            r#"
            UPDATE build_jobs
            SET status = 'building', started_at = NOW()
            WHERE id = (
                SELECT id FROM build_jobs
                WHERE status = 'queued'
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(payload.map(|p| p.0))
    }

    pub async fn get_job(&self, job_id: ResourceId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT payload, status, worker_id, started_at, completed_at
            FROM build_jobs WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_err)?;

        row.map(JobRecord::try_from).transpose()
    }

    pub async fn get_result(&self, job_id: ResourceId) -> Result<Option<BuildResult>> {
        let result: Option<Option<Json<BuildResult>>> =
            sqlx::query_scalar("SELECT result FROM build_jobs WHERE id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(queue_err)?;
        Ok(result.flatten().map(|r| r.0))
    }

    /// Lines appended for a job, oldest first.
    pub async fn logs(&self, job_id: ResourceId) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT line FROM build_logs WHERE job_id = $1 ORDER BY id")
            .bind(job_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(queue_err)
    }

    /// Number of jobs waiting to be claimed.
    pub async fn queue_length(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM build_jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await
            .map_err(queue_err)
    }

    pub async fn active_workers(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT worker_id FROM build_workers ORDER BY registered_at")
            .fetch_all(&self.pool)
            .await
            .map_err(queue_err)
    }

    /// Cancel a job that has not been claimed yet. Returns whether it was.
    pub async fn cancel(&self, job_id: ResourceId) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = 'cancelled', completed_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(done.rows_affected() == 1)
    }

    async fn exists(&self, job_id: ResourceId) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM build_jobs WHERE id = $1)")
            .bind(job_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(queue_err)
    }
}

#[async_trait]
impl BuildQueue for PgBuildQueue {
    async fn dequeue(&self, wait: Duration) -> Result<Option<BuildJob>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.claim().await? {
                debug!(job_id = %job.id, "Claimed build job");
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            sleep(remaining.min(POLL_STEP)).await;
        }
    }

    async fn update_status(
        &self,
        job_id: ResourceId,
        status: JobStatus,
        worker_id: &WorkerId,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = $2,
                worker_id = $3,
                started_at = CASE WHEN $2 = 'building' THEN COALESCE(started_at, NOW())
                                  ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW()
                                    ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("build job {}", job_id)));
        }
        Ok(())
    }

    async fn set_result(&self, job_id: ResourceId, result: &BuildResult) -> Result<()> {
        let stored = sqlx::query("UPDATE build_jobs SET result = $2 WHERE id = $1 AND result IS NULL")
            .bind(job_id.as_uuid())
            .bind(Json(result))
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;

        if stored.rows_affected() == 0 {
            if !self.exists(job_id).await? {
                return Err(Error::NotFound(format!("build job {}", job_id)));
            }
            debug!(job_id = %job_id, "Result already recorded, keeping the first");
        }
        Ok(())
    }

    async fn append_log(&self, job_id: ResourceId, line: &str) -> Result<()> {
        sqlx::query("INSERT INTO build_logs (job_id, line) VALUES ($1, $2)")
            .bind(job_id.as_uuid())
            .bind(line)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn register_worker(&self, worker_id: &WorkerId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_workers (worker_id) VALUES ($1)
            ON CONFLICT (worker_id) DO UPDATE SET last_seen_at = NOW()
            "#,
        )
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &WorkerId) -> Result<()> {
        sqlx::query("DELETE FROM build_workers WHERE worker_id = $1")
            .bind(worker_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }
}
