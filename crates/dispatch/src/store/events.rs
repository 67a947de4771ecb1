use super::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobEventRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub event_type: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Db {
    pub async fn append_job_event(
        &self,
        job_id: Uuid,
        event_type: &str,
        message: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "insert into dispatch.job_events (id, job_id, event_type, message, data) \
             values ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(event_type)
        .bind(message)
        .bind(data)
        .execute(&self.pool)
        .await
        .context("append job event")?;
        Ok(())
    }

    pub async fn job_events(&self, job_id: Uuid) -> Result<Vec<JobEventRow>> {
        let rows = sqlx::query_as::<_, JobEventRow>(
            "select id, job_id, event_type, message, data, created_at \
             from dispatch.job_events where job_id = $1 order by created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("select job events")?;
        Ok(rows)
    }
}
