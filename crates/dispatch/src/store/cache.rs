use super::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheRow {
    pub id: Uuid,
    pub manifest_hash: String,
    pub preset: String,
    pub result_key: String,
    pub output_name: String,
    pub created_at: DateTime<Utc>,
}

impl Db {
    pub async fn cache_lookup(
        &self,
        manifest_hash: &str,
        preset: &str,
    ) -> Result<Option<CacheRow>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "select id, manifest_hash, preset, result_key, output_name, created_at \
             from dispatch.cache_entries where manifest_hash = $1 and preset = $2",
        )
        .bind(manifest_hash)
        .bind(preset)
        .fetch_optional(&self.pool)
        .await
        .context("select cache entry")?;
        Ok(row)
    }

    /// Records a finished render for reuse. Concurrent workers may race on
    /// the same (fingerprint, preset); the first insert wins and the rest
    /// are no-ops.
    pub async fn cache_insert_if_absent(
        &self,
        manifest_hash: &str,
        preset: &str,
        result_key: &str,
        output_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "insert into dispatch.cache_entries \
                (id, manifest_hash, preset, result_key, output_name) \
             values ($1, $2, $3, $4, $5) \
             on conflict (manifest_hash, preset) do nothing",
        )
        .bind(Uuid::new_v4())
        .bind(manifest_hash)
        .bind(preset)
        .bind(result_key)
        .bind(output_name)
        .execute(&self.pool)
        .await
        .context("insert cache entry")?;
        Ok(())
    }
}
