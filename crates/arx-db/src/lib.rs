//! PostgreSQL persistence for the billing snapshot archive.
//!
//! Three durable surfaces live here: the snapshot repository
//! ([`snapshots`]), the job ledger ([`jobs`]) and the scheduler config row
//! ([`scheduler`]). Module functions take `&PgPool` directly; [`PgStore`]
//! wraps a pool and implements the [`store`] traits so async callers
//! (orchestrator, daemon) can stay generic over the backing storage.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod jobs;
pub mod scheduler;
pub mod snapshots;
pub mod store;

pub use store::{ConfigStore, JobStore, PgStore, SnapshotStore, StoreError};

pub const ENV_DB_URL: &str = "ARX_DATABASE_URL";

/// Connect to Postgres using ARX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='snapshots'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_snapshots_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_snapshots_table: bool,
}

/// Count jobs that are operationally active (pending or running).
/// Used by CLI guardrails to prevent migrating a DB with a run in flight.
pub async fn count_active_jobs(pool: &PgPool) -> Result<i64> {
    // If schema doesn't exist yet, treat as 0 (safe) rather than failing.
    let st = status(pool).await?;
    if !st.has_snapshots_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from jobs
        where status in ('pending', 'running')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("count_active_jobs failed")?;

    Ok(n)
}
