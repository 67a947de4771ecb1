use super::Db;
use anyhow::{Context, Result};
use uuid::Uuid;

impl Db {
    /// Cost already accrued by this user for the given `YYYY-MM` month key.
    pub async fn month_cost_usd(&self, user_id: Uuid, month: &str) -> Result<f64> {
        let cost: Option<f64> = sqlx::query_scalar(
            "select cost_usd from dispatch.usage_months where user_id = $1 and month = $2",
        )
        .bind(user_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await
        .context("select month usage")?;
        Ok(cost.unwrap_or(0.0))
    }

    /// Folds a finished job into the monthly aggregate. Only ever additive,
    /// so the aggregate is monotone within a month.
    pub async fn add_month_usage(
        &self,
        user_id: Uuid,
        month: &str,
        cost_usd: f64,
        minutes: f64,
    ) -> Result<()> {
        sqlx::query(
            "insert into dispatch.usage_months (id, user_id, month, cost_usd, minutes) \
             values ($1, $2, $3, $4, $5) \
             on conflict (user_id, month) do update set \
                cost_usd = dispatch.usage_months.cost_usd + excluded.cost_usd, \
                minutes = dispatch.usage_months.minutes + excluded.minutes, \
                updated_at = now()",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(month)
        .bind(cost_usd)
        .bind(minutes)
        .execute(&self.pool)
        .await
        .context("upsert month usage")?;
        Ok(())
    }
}

/// Month key for usage aggregation, `YYYY-MM` in UTC.
pub fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}
