use crate::error::{Error, Result};
use crate::types::round_cents;
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Append-only double-entry credit ledger. Balances are always derived from
/// the entries; every mutating operation runs in one transaction that first
/// takes a per-user advisory lock so concurrent reservations cannot oversell.
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balances {
    pub posted_usd: f64,
    pub reserved_usd: f64,
    pub available_usd: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub entry_type: String,
    pub status: String,
    pub amount_usd: f64,
    pub currency: String,
    pub job_id: Option<Uuid>,
    pub external_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of converting a reservation into a posted charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementPlan {
    /// What the user actually pays, capped at what they can cover.
    pub charge_usd: f64,
    /// Set when the requested cost exceeded what the user could cover.
    pub shortfall_usd: Option<f64>,
    /// Positive: refund of the unused reservation. Negative: overage charge.
    pub adjustment_usd: Option<f64>,
}

/// Pure settlement arithmetic. `reserved` is the absolute reserved amount,
/// `available` the user's available balance with the reservation still held.
pub fn plan_settlement(reserved_usd: f64, available_usd: f64, actual_cost_usd: f64) -> SettlementPlan {
    let max_charge = (available_usd + reserved_usd).max(0.0);
    let charge = actual_cost_usd.clamp(0.0, max_charge);
    let shortfall = if actual_cost_usd > max_charge {
        Some(round_cents(actual_cost_usd - max_charge))
    } else {
        None
    };
    let adjustment = if charge < reserved_usd {
        Some(reserved_usd - charge)
    } else if charge > reserved_usd {
        Some(-(charge - reserved_usd))
    } else {
        None
    };
    SettlementPlan {
        charge_usd: charge,
        shortfall_usd: shortfall,
        adjustment_usd: adjustment,
    }
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Serializes all ledger writes for one user within the transaction.
    async fn lock_user(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<()> {
        sqlx::query("select pg_advisory_xact_lock(hashtext($1::text))")
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .context("acquire per-user ledger lock")?;
        Ok(())
    }

    async fn balances_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> Result<Balances> {
        let row = sqlx::query(
            "select \
                coalesce(sum(amount_usd) filter (where status = 'posted'), 0)::float8 as posted, \
                coalesce(sum(amount_usd) filter (where status = 'reserved'), 0)::float8 as reserved \
             from dispatch.credit_ledger where user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .context("aggregate ledger balances")?;
        let posted: f64 = row.try_get("posted")?;
        let reserved: f64 = row.try_get("reserved")?;
        Ok(Balances {
            posted_usd: posted,
            reserved_usd: reserved.abs(),
            available_usd: posted + reserved,
        })
    }

    pub async fn balances(&self, user_id: Uuid) -> Result<Balances> {
        let mut tx = self.pool.begin().await.context("begin balances tx")?;
        let balances = Self::balances_in_tx(&mut tx, user_id).await?;
        tx.commit().await.context("commit balances tx")?;
        Ok(balances)
    }

    pub async fn recent_entries(&self, user_id: Uuid, limit: i64) -> Result<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(
            "select id, user_id, entry_type, status, amount_usd, currency, job_id, \
                    external_id, details, created_at \
             from dispatch.credit_ledger \
             where user_id = $1 order by created_at desc limit $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("select recent ledger entries")?;
        Ok(entries)
    }

    /// Earmarks `amount_usd` for a job. Idempotent per `(job_id, RESERVE)`:
    /// a repeat call returns current balances unchanged.
    pub async fn reserve(&self, user_id: Uuid, job_id: Uuid, amount_usd: f64) -> Result<Balances> {
        if amount_usd <= 0.0 {
            return Err(Error::validation("Reservation amount must be positive"));
        }

        let mut tx = self.pool.begin().await.context("begin reserve tx")?;
        Self::lock_user(&mut tx, user_id).await?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            "select id from dispatch.credit_ledger \
             where job_id = $1 and entry_type = 'RESERVE'",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("select existing reservation")?;
        if existing.is_some() {
            let balances = Self::balances_in_tx(&mut tx, user_id).await?;
            tx.commit().await.context("commit reserve tx")?;
            return Ok(balances);
        }

        let balances = Self::balances_in_tx(&mut tx, user_id).await?;
        if balances.available_usd < amount_usd {
            return Err(Error::policy("Insufficient credits"));
        }

        sqlx::query(
            "insert into dispatch.credit_ledger \
                (id, user_id, entry_type, status, amount_usd, currency, job_id) \
             values ($1, $2, 'RESERVE', 'reserved', $3, 'USD', $4) \
             on conflict (job_id, entry_type) where job_id is not null do nothing",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(-amount_usd)
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("insert reservation entry")?;

        let balances = Self::balances_in_tx(&mut tx, user_id).await?;
        tx.commit().await.context("commit reserve tx")?;
        Ok(balances)
    }

    /// Converts the job's reservation into a posted charge, refunding the
    /// unused portion or appending an overage settlement. No-op unless the
    /// reservation is still in status `reserved`.
    pub async fn settle(&self, job_id: Uuid, actual_cost_usd: f64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin settle tx")?;

        let reserve = sqlx::query(
            "select id, user_id, amount_usd, status from dispatch.credit_ledger \
             where job_id = $1 and entry_type = 'RESERVE'",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("select reservation for settlement")?;
        let Some(reserve) = reserve else {
            return Ok(());
        };
        let user_id: Uuid = reserve.try_get("user_id")?;

        Self::lock_user(&mut tx, user_id).await?;

        // Re-read under the lock; another settle/void may have won the race.
        let status: Option<String> = sqlx::query_scalar(
            "select status from dispatch.credit_ledger \
             where job_id = $1 and entry_type = 'RESERVE'",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("re-read reservation status")?;
        if status.as_deref() != Some("reserved") {
            return Ok(());
        }

        let reserve_id: Uuid = reserve.try_get("id")?;
        let reserved_amount: f64 = reserve.try_get::<f64, _>("amount_usd")?.abs();
        let balances = Self::balances_in_tx(&mut tx, user_id).await?;
        let plan = plan_settlement(reserved_amount, balances.available_usd, actual_cost_usd);

        // The reservation posts at its full amount; the refund or overage
        // entry below nets the posted total to exactly the charge. Posting at
        // the charge and also refunding would double-count the unused part.
        let details = plan.shortfall_usd.map(|shortfall| {
            serde_json::json!({ "reason": "insufficient_funds", "shortfall": shortfall })
        });
        sqlx::query(
            "update dispatch.credit_ledger \
             set status = 'posted', details = coalesce($1, details) \
             where id = $2",
        )
        .bind(details)
        .bind(reserve_id)
        .execute(&mut *tx)
        .await
        .context("post settled reservation")?;

        if let Some(adjustment) = plan.adjustment_usd {
            let (entry_type, reason) = if adjustment > 0.0 {
                ("REFUND", "unused_reservation")
            } else {
                ("SETTLEMENT", "overage")
            };
            sqlx::query(
                "insert into dispatch.credit_ledger \
                    (id, user_id, entry_type, status, amount_usd, currency, job_id, details) \
                 values ($1, $2, $3, 'posted', $4, 'USD', $5, $6) \
                 on conflict (job_id, entry_type) where job_id is not null do nothing",
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(entry_type)
            .bind(adjustment)
            .bind(job_id)
            .bind(serde_json::json!({ "reason": reason }))
            .execute(&mut *tx)
            .await
            .context("insert settlement adjustment entry")?;
        }

        tx.commit().await.context("commit settle tx")?;
        Ok(())
    }

    /// Releases a still-held reservation. No-op if absent or already settled.
    pub async fn void(&self, job_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            "update dispatch.credit_ledger \
             set status = 'voided', details = $1 \
             where job_id = $2 and entry_type = 'RESERVE' and status = 'reserved'",
        )
        .bind(serde_json::json!({ "reason": reason }))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("void reservation")?;
        Ok(())
    }

    /// Posts purchased credit. Idempotent by `external_id`, so webhook
    /// retries are safe.
    pub async fn purchase(
        &self,
        user_id: Uuid,
        amount_usd: f64,
        external_id: &str,
        source: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin purchase tx")?;
        Self::lock_user(&mut tx, user_id).await?;
        sqlx::query(
            "insert into dispatch.credit_ledger \
                (id, user_id, entry_type, status, amount_usd, currency, external_id, details) \
             values ($1, $2, 'PURCHASE', 'posted', $3, 'USD', $4, $5) \
             on conflict (external_id) where external_id is not null do nothing",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount_usd)
        .bind(external_id)
        .bind(serde_json::json!({ "source": source }))
        .execute(&mut *tx)
        .await
        .context("insert purchase entry")?;
        tx.commit().await.context("commit purchase tx")?;
        Ok(())
    }

    /// Manual (admin) credit or debit. Idempotent by `external_id` when one
    /// is supplied; the amount may be negative.
    pub async fn adjust(
        &self,
        user_id: Uuid,
        amount_usd: f64,
        reason: &str,
        external_id: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin adjust tx")?;
        Self::lock_user(&mut tx, user_id).await?;
        sqlx::query(
            "insert into dispatch.credit_ledger \
                (id, user_id, entry_type, status, amount_usd, currency, external_id, details) \
             values ($1, $2, 'ADJUSTMENT', 'posted', $3, 'USD', $4, $5) \
             on conflict (external_id) where external_id is not null do nothing",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(amount_usd)
        .bind(external_id)
        .bind(serde_json::json!({ "reason": reason }))
        .execute(&mut *tx)
        .await
        .context("insert adjustment entry")?;
        tx.commit().await.context("commit adjust tx")?;
        Ok(())
    }

    /// Whether any ledger entry exists for this external id.
    pub async fn external_id_exists(&self, external_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "select exists(select 1 from dispatch.credit_ledger where external_id = $1)",
        )
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .context("check external id")?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::plan_settlement;

    #[test]
    fn settle_under_reservation_refunds_the_rest() {
        // $10 reserved out of $100 posted: available is $90.
        let plan = plan_settlement(10.0, 90.0, 6.0);
        assert_eq!(plan.charge_usd, 6.0);
        assert_eq!(plan.shortfall_usd, None);
        assert_eq!(plan.adjustment_usd, Some(4.0));
    }

    #[test]
    fn settle_exact_reservation_emits_no_adjustment() {
        let plan = plan_settlement(10.0, 90.0, 10.0);
        assert_eq!(plan.charge_usd, 10.0);
        assert_eq!(plan.adjustment_usd, None);
        assert_eq!(plan.shortfall_usd, None);
    }

    #[test]
    fn settle_over_reservation_appends_overage() {
        let plan = plan_settlement(10.0, 90.0, 25.0);
        assert_eq!(plan.charge_usd, 25.0);
        assert_eq!(plan.shortfall_usd, None);
        assert_eq!(plan.adjustment_usd, Some(-15.0));
    }

    #[test]
    fn settle_beyond_cover_records_shortfall() {
        // $10 reserved, only $2 otherwise available: ceiling is $12.
        let plan = plan_settlement(10.0, 2.0, 20.0);
        assert_eq!(plan.charge_usd, 12.0);
        assert_eq!(plan.shortfall_usd, Some(8.0));
        assert_eq!(plan.adjustment_usd, Some(-2.0));
    }

    #[test]
    fn negative_cost_clamps_to_zero_and_refunds_everything() {
        let plan = plan_settlement(10.0, 90.0, -3.0);
        assert_eq!(plan.charge_usd, 0.0);
        assert_eq!(plan.adjustment_usd, Some(10.0));
        assert_eq!(plan.shortfall_usd, None);
    }

    #[test]
    fn reserve_then_settle_reduces_posted_by_exactly_actual() {
        // The reservation posts in full and the adjustment entry nets the
        // difference, so posted always moves by exactly the charge.
        for (reserved, available, actual) in
            [(10.0, 90.0, 7.5), (10.0, 90.0, 10.0), (10.0, 90.0, 25.0)]
        {
            let plan = plan_settlement(reserved, available, actual);
            let posted_delta = -reserved + plan.adjustment_usd.unwrap_or(0.0);
            assert_eq!(posted_delta, -plan.charge_usd);
            assert_eq!(plan.charge_usd, actual);
        }
    }
}
