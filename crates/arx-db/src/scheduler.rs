//! Scheduler config row: singleton policy for automated snapshot runs.
//!
//! The row is created on first read with the defaults from `arx-schemas`.
//! Operators replace the policy fields whole-object; the orchestrator alone
//! writes the last-run fields, after a scheduled job reaches a terminal
//! state.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use arx_schemas::{LastRunStatus, SchedulerConfig, SchedulerConfigUpdate};

use crate::store::StoreError;

/// Load the config, inserting the default row if none exists yet.
pub async fn load(pool: &PgPool) -> Result<SchedulerConfig, StoreError> {
    sqlx::query(
        r#"
        insert into scheduler_config (id)
        values (1)
        on conflict (id) do nothing
        "#,
    )
    .execute(pool)
    .await?;

    let row = sqlx::query(
        r#"
        select
          enabled, day_of_month, hour, snapshot_previous_month,
          snapshot_all_accounts, last_run_at, last_run_status,
          last_run_count, updated_at
        from scheduler_config
        where id = 1
        "#,
    )
    .fetch_one(pool)
    .await?;

    config_from_row(&row)
}

/// Whole-object replacement of the policy fields. Last-run fields are left
/// untouched.
pub async fn replace(
    pool: &PgPool,
    update: SchedulerConfigUpdate,
) -> Result<SchedulerConfig, StoreError> {
    update
        .validate()
        .map_err(|e| StoreError::Validation(e.to_string()))?;

    sqlx::query(
        r#"
        insert into scheduler_config (
          id, enabled, day_of_month, hour, snapshot_previous_month,
          snapshot_all_accounts, updated_at
        ) values (
          1, $1, $2, $3, $4, $5, now()
        )
        on conflict (id) do update set
          enabled = excluded.enabled,
          day_of_month = excluded.day_of_month,
          hour = excluded.hour,
          snapshot_previous_month = excluded.snapshot_previous_month,
          snapshot_all_accounts = excluded.snapshot_all_accounts,
          updated_at = now()
        "#,
    )
    .bind(update.enabled)
    .bind(update.day_of_month)
    .bind(update.hour)
    .bind(update.snapshot_previous_month)
    .bind(update.snapshot_all_accounts)
    .execute(pool)
    .await?;

    load(pool).await
}

/// Record the outcome of a finished scheduled run.
pub async fn record_last_run(
    pool: &PgPool,
    at: DateTime<Utc>,
    status: LastRunStatus,
    count: i32,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        update scheduler_config
        set last_run_at = $1,
            last_run_status = $2,
            last_run_count = $3
        where id = 1
        "#,
    )
    .bind(at)
    .bind(status.as_str())
    .bind(count)
    .execute(pool)
    .await?;

    Ok(())
}

fn config_from_row(row: &PgRow) -> Result<SchedulerConfig, StoreError> {
    let last_run_status: String = row.try_get("last_run_status")?;

    Ok(SchedulerConfig {
        enabled: row.try_get("enabled")?,
        day_of_month: row.try_get("day_of_month")?,
        hour: row.try_get("hour")?,
        snapshot_previous_month: row.try_get("snapshot_previous_month")?,
        snapshot_all_accounts: row.try_get("snapshot_all_accounts")?,
        last_run_at: row.try_get("last_run_at")?,
        last_run_status: LastRunStatus::parse(&last_run_status)
            .map_err(|e| StoreError::Validation(format!("stored last_run_status invalid: {e}")))?,
        last_run_count: row.try_get("last_run_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}
