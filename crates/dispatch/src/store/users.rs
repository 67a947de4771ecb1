use super::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub api_key_hash: String,
    pub api_key_hint: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub monthly_limit_usd: f64,
    pub per_job_max_usd: f64,
    pub created_at: DateTime<Utc>,
}

const SELECT_USER: &str = "select id, email, api_key_hash, api_key_hint, is_active, \
    is_admin, monthly_limit_usd, per_job_max_usd, created_at from dispatch.users";

impl Db {
    pub async fn user_by_id(&self, user_id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} where id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("select user by id")?;
        Ok(row)
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} where email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("select user by email")?;
        Ok(row)
    }

    /// All active users, for API-key verification scans. Key hashes are
    /// salted, so lookup has to try each candidate.
    pub async fn active_users(&self) -> Result<Vec<UserRow>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!("{SELECT_USER} where is_active"))
            .fetch_all(&self.pool)
            .await
            .context("select active users")?;
        Ok(rows)
    }

    pub async fn insert_user(
        &self,
        email: &str,
        api_key_hash: &str,
        api_key_hint: &str,
        is_admin: bool,
    ) -> Result<UserRow> {
        let row = sqlx::query_as::<_, UserRow>(
            "insert into dispatch.users (id, email, api_key_hash, api_key_hint, is_admin) \
             values ($1, $2, $3, $4, $5) \
             returning id, email, api_key_hash, api_key_hint, is_active, is_admin, \
                       monthly_limit_usd, per_job_max_usd, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(api_key_hash)
        .bind(api_key_hint)
        .bind(is_admin)
        .fetch_one(&self.pool)
        .await
        .context("insert user")?;
        Ok(row)
    }

    pub async fn rotate_user_api_key(
        &self,
        user_id: Uuid,
        api_key_hash: &str,
        api_key_hint: &str,
    ) -> Result<()> {
        let n = sqlx::query(
            "update dispatch.users set api_key_hash = $2, api_key_hint = $3 where id = $1",
        )
        .bind(user_id)
        .bind(api_key_hash)
        .bind(api_key_hint)
        .execute(&self.pool)
        .await
        .context("rotate user api key")?
        .rows_affected();
        if n != 1 {
            anyhow::bail!("no such user: {user_id}");
        }
        Ok(())
    }
}
