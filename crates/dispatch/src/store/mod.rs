use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, Executor, PgPool, Postgres};

mod cache;
mod events;
mod jobs;
mod usage;
mod users;

pub use cache::CacheRow;
pub use events::JobEventRow;
pub use jobs::{JobRow, NewJob};
pub use usage::current_month;
pub use users::UserRow;

const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("../../db/migrations/0001_schema.sql")),
    (2, include_str!("../../db/migrations/0002_jobs.sql")),
    (3, include_str!("../../db/migrations/0003_ledger.sql")),
];

/// Handle to the relational store, the single source of truth for users,
/// jobs, events, usage, the result cache, and the credit ledger.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        // Prevent concurrent migrations when several processes start at once.
        //
        // Advisory locks are per-session/connection, so the whole migration
        // sequence must run on a single connection; otherwise the lock could
        // be taken on one connection and "released" on another.
        const MIGRATION_LOCK_KEY: i64 = 0x5245_4E44_4D49_4752; // "RENDMIGR"
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for migrations")?;

        sqlx::query("select pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("acquire migration lock")?;

        let res: Result<()> = async {
            // Schema and migration table must exist before they can be read.
            exec_sql_batch(&mut *conn, MIGRATIONS[0].1)
                .await
                .context("apply schema bootstrap (v1)")?;

            for (version, sql) in MIGRATIONS {
                if *version == 1 {
                    continue;
                }
                let applied: Option<i32> = sqlx::query_scalar(
                    "select version from dispatch.schema_migrations where version = $1",
                )
                .bind(*version)
                .fetch_optional(&mut *conn)
                .await
                .context("read dispatch.schema_migrations")?;

                if applied.is_some() {
                    continue;
                }

                let mut tx = conn.begin().await.context("begin migration tx")?;
                exec_sql_batch(&mut *tx, sql)
                    .await
                    .with_context(|| format!("apply migration v{version}"))?;
                sqlx::query("insert into dispatch.schema_migrations(version) values ($1)")
                    .bind(*version)
                    .execute(&mut *tx)
                    .await
                    .context("insert dispatch.schema_migrations")?;
                tx.commit().await.context("commit migration tx")?;
            }
            Ok(())
        }
        .await;

        // Best-effort unlock on the same connection that acquired it.
        let _ = sqlx::query("select pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;

        res
    }
}

async fn exec_sql_batch<E>(exec: &mut E, sql: &str) -> Result<()>
where
    for<'c> &'c mut E: Executor<'c, Database = Postgres>,
{
    for stmt in sql.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(&mut *exec).await.with_context(|| {
            format!(
                "execute migration statement: {}",
                s.lines().next().unwrap_or("")
            )
        })?;
    }
    Ok(())
}
