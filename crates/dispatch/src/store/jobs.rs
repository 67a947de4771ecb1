use super::Db;
use crate::manifest::Manifest;
use crate::types::{CustomOptions, JobStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

const TERMINAL_GUARD: &str = "status not in ('COMPLETED', 'FAILED', 'CANCELLED')";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub preset: String,
    pub gpu_class: String,
    pub manifest: serde_json::Value,
    pub custom_options: Option<serde_json::Value>,
    pub manifest_hash: String,
    pub project_hash: String,
    pub bundle_key: String,
    pub bundle_sha256: String,
    pub bundle_size_bytes: i64,
    pub result_key: Option<String>,
    pub output_name: String,
    pub notification_email: Option<String>,
    pub cost_estimate_usd: f64,
    pub cost_final_usd: Option<f64>,
    pub eta_seconds: i64,
    pub progress_percent: f64,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status).map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn manifest(&self) -> Result<Manifest> {
        serde_json::from_value(self.manifest.clone()).context("decode job manifest")
    }

    pub fn custom_options(&self) -> Result<Option<CustomOptions>> {
        self.custom_options
            .clone()
            .map(|v| serde_json::from_value(v).context("decode job custom options"))
            .transpose()
    }
}

/// Fields common to both insert paths; the cached variant fills in the
/// terminal columns directly.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub preset: String,
    pub gpu_class: String,
    pub manifest: serde_json::Value,
    pub custom_options: Option<serde_json::Value>,
    pub manifest_hash: String,
    pub project_hash: String,
    pub bundle_key: String,
    pub bundle_sha256: String,
    pub bundle_size_bytes: i64,
    pub output_name: String,
    pub notification_email: Option<String>,
    pub cost_estimate_usd: f64,
    pub eta_seconds: i64,
    pub max_attempts: i32,
}

const SELECT_JOB: &str = "select id, user_id, status, preset, gpu_class, manifest, \
    custom_options, manifest_hash, project_hash, bundle_key, bundle_sha256, \
    bundle_size_bytes, result_key, output_name, notification_email, \
    cost_estimate_usd, cost_final_usd, eta_seconds, progress_percent, attempts, \
    max_attempts, error_message, cancel_requested, cache_hit, created_at, \
    started_at, finished_at from dispatch.jobs";

impl Db {
    pub async fn insert_queued_job(&self, job: &NewJob) -> Result<()> {
        sqlx::query(
            "insert into dispatch.jobs \
                (id, user_id, status, preset, gpu_class, manifest, custom_options, \
                 manifest_hash, project_hash, bundle_key, bundle_sha256, \
                 bundle_size_bytes, output_name, notification_email, \
                 cost_estimate_usd, eta_seconds, progress_percent, max_attempts) \
             values ($1, $2, 'QUEUED', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                     $13, $14, $15, 0, $16)",
        )
        .bind(job.id)
        .bind(job.user_id)
        .bind(&job.preset)
        .bind(&job.gpu_class)
        .bind(&job.manifest)
        .bind(&job.custom_options)
        .bind(&job.manifest_hash)
        .bind(&job.project_hash)
        .bind(&job.bundle_key)
        .bind(&job.bundle_sha256)
        .bind(job.bundle_size_bytes)
        .bind(&job.output_name)
        .bind(&job.notification_email)
        .bind(job.cost_estimate_usd)
        .bind(job.eta_seconds)
        .bind(job.max_attempts)
        .execute(&self.pool)
        .await
        .context("insert queued job")?;
        Ok(())
    }

    /// Cache-hit path: the job is born completed, pointing at the cached
    /// artifact.
    pub async fn insert_cached_job(
        &self,
        job: &NewJob,
        result_key: &str,
        output_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "insert into dispatch.jobs \
                (id, user_id, status, preset, gpu_class, manifest, custom_options, \
                 manifest_hash, project_hash, bundle_key, bundle_sha256, \
                 bundle_size_bytes, result_key, output_name, notification_email, \
                 cost_estimate_usd, cost_final_usd, eta_seconds, progress_percent, \
                 max_attempts, cache_hit, started_at, finished_at) \
             values ($1, $2, 'COMPLETED', $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                     $12, $13, $14, $15, $15, 0, 100, $16, true, now(), now())",
        )
        .bind(job.id)
        .bind(job.user_id)
        .bind(&job.preset)
        .bind(&job.gpu_class)
        .bind(&job.manifest)
        .bind(&job.custom_options)
        .bind(&job.manifest_hash)
        .bind(&job.project_hash)
        .bind(&job.bundle_key)
        .bind(&job.bundle_sha256)
        .bind(job.bundle_size_bytes)
        .bind(result_key)
        .bind(output_name)
        .bind(&job.notification_email)
        .bind(job.cost_estimate_usd)
        .bind(job.max_attempts)
        .execute(&self.pool)
        .await
        .context("insert cached job")?;
        Ok(())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_JOB} where id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("select job")?;
        Ok(row)
    }

    pub async fn job_owned(&self, job_id: Uuid, user_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_JOB} where id = $1 and user_id = $2"
        ))
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("select owned job")?;
        Ok(row)
    }

    pub async fn recent_jobs(&self, user_id: Uuid, limit: i64) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_JOB} where user_id = $1 order by created_at desc limit $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("select recent jobs")?;
        Ok(rows)
    }

    /// Non-terminal lifecycle transition. Progress only ever moves forward;
    /// the clamped value actually stored is returned for publishing.
    /// `started_at` is stamped on the first transition into RENDERING.
    pub async fn advance_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: f64,
        error: Option<&str>,
    ) -> Result<f64> {
        let row = sqlx::query(&format!(
            "update dispatch.jobs set \
                status = $2, \
                progress_percent = greatest(progress_percent, $3), \
                error_message = coalesce($4, error_message), \
                started_at = case when $2 = 'RENDERING' and started_at is null \
                                  then now() else started_at end \
             where id = $1 and {TERMINAL_GUARD} \
             returning progress_percent",
        ))
        .bind(job_id)
        .bind(status.as_db_str())
        .bind(progress)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .context("advance job")?;
        match row {
            Some(row) => Ok(row.try_get("progress_percent")?),
            None => anyhow::bail!("job {job_id} is terminal or missing"),
        }
    }

    /// Terminal transition. Progress is set directly (0 or 100).
    pub async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: f64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "update dispatch.jobs set \
                status = $2, progress_percent = $3, \
                error_message = coalesce($4, error_message), \
                finished_at = now() \
             where id = $1 and {TERMINAL_GUARD}",
        ))
        .bind(job_id)
        .bind(status.as_db_str())
        .bind(progress)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("finish job")?;
        Ok(())
    }

    /// Successful completion: records the artifact and the final cost.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        result_key: &str,
        output_name: &str,
        cost_final_usd: f64,
    ) -> Result<()> {
        sqlx::query(&format!(
            "update dispatch.jobs set \
                status = 'COMPLETED', progress_percent = 100, \
                result_key = $2, output_name = $3, cost_final_usd = $4, \
                finished_at = now() \
             where id = $1 and {TERMINAL_GUARD}",
        ))
        .bind(job_id)
        .bind(result_key)
        .bind(output_name)
        .bind(cost_final_usd)
        .execute(&self.pool)
        .await
        .context("complete job")?;
        Ok(())
    }

    pub async fn set_cancel_requested(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("update dispatch.jobs set cancel_requested = true where id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("set cancel_requested")?;
        Ok(())
    }

    /// Compare-and-set cancellation for jobs that have not been picked up.
    /// Returns whether this call won the transition.
    pub async fn cancel_job_if_queued(&self, job_id: Uuid) -> Result<bool> {
        let n = sqlx::query(
            "update dispatch.jobs set \
                status = 'CANCELLED', progress_percent = 0, finished_at = now() \
             where id = $1 and status = 'QUEUED'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("cancel queued job")?
        .rows_affected();
        Ok(n == 1)
    }

    pub async fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let requested: bool =
            sqlx::query_scalar("select cancel_requested from dispatch.jobs where id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .context("read cancel_requested")?;
        Ok(requested)
    }

    /// Counts a failed attempt; the caller decides between re-enqueue and a
    /// terminal failure from the returned pair.
    pub async fn bump_job_attempts(&self, job_id: Uuid) -> Result<(i32, i32)> {
        let row = sqlx::query(
            "update dispatch.jobs set attempts = attempts + 1 \
             where id = $1 returning attempts, max_attempts",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .context("bump job attempts")?;
        Ok((row.try_get("attempts")?, row.try_get("max_attempts")?))
    }

    /// Puts a transiently failed job back at the queue stage. Progress resets
    /// below the running maximum on purpose: a retry starts a fresh attempt.
    pub async fn requeue_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(&format!(
            "update dispatch.jobs set status = 'QUEUED', progress_percent = 10 \
             where id = $1 and {TERMINAL_GUARD}",
        ))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("requeue job")?;
        Ok(())
    }
}
