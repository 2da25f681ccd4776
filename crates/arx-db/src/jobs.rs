//! Job ledger: durable record of orchestration runs and their per-account
//! outcomes.
//!
//! Status transitions are guarded in SQL (`where status in (...)`) so a
//! terminal job can never regress, even if two writers raced. The
//! orchestrator is the only writer in practice; the guard makes that an
//! enforced property rather than a convention.

use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use arx_schemas::{
    AccountOutcome, JobCounts, JobDetail, JobRecord, JobStatus, JobType, OutcomeKind,
};

use crate::store::{NewJob, StoreError};

/// Insert a new job row with status `pending` and zeroed counters.
pub async fn open_job(pool: &PgPool, job: &NewJob) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        insert into jobs (
          job_id, job_type, status, target_year, target_month, dry_run, triggered_by
        ) values (
          $1, $2, 'pending', $3, $4, $5, $6
        )
        "#,
    )
    .bind(job.job_id)
    .bind(job.job_type.as_str())
    .bind(job.target_year)
    .bind(job.target_month)
    .bind(job.dry_run)
    .bind(&job.triggered_by)
    .execute(pool)
    .await?;

    Ok(())
}

/// `pending -> running`, recording the resolved roster size.
pub async fn mark_running(pool: &PgPool, job_id: Uuid, total: i32) -> Result<(), StoreError> {
    let res = sqlx::query(
        r#"
        update jobs
        set status = 'running',
            total_accounts = $2
        where job_id = $1
          and status = 'pending'
        "#,
    )
    .bind(job_id)
    .bind(total)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(StoreError::InvalidState(format!(
            "job {job_id} is not pending"
        )));
    }
    Ok(())
}

/// Incremental counter update for a running job.
pub async fn update_progress(
    pool: &PgPool,
    job_id: Uuid,
    counts: JobCounts,
) -> Result<(), StoreError> {
    let res = sqlx::query(
        r#"
        update jobs
        set completed_accounts = $2,
            success_count = $3,
            failed_count = $4
        where job_id = $1
          and status = 'running'
        "#,
    )
    .bind(job_id)
    .bind(counts.completed)
    .bind(counts.success)
    .bind(counts.failed)
    .execute(pool)
    .await?;

    if res.rows_affected() == 0 {
        return Err(StoreError::InvalidState(format!(
            "job {job_id} is not running"
        )));
    }
    Ok(())
}

/// Finalize a job exactly once: terminal status, final counts, run-level
/// error, and the roster-ordered outcome list, all in one transaction.
pub async fn finalize_job(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
    counts: JobCounts,
    error: Option<String>,
    outcomes: Vec<AccountOutcome>,
) -> Result<(), StoreError> {
    if !status.is_terminal() {
        return Err(StoreError::InvalidState(format!(
            "finalize_job requires a terminal status, got {}",
            status.as_str()
        )));
    }

    let mut tx = pool.begin().await?;

    let res = sqlx::query(
        r#"
        update jobs
        set status = $2,
            completed_accounts = $3,
            success_count = $4,
            failed_count = $5,
            error = $6,
            finished_at = now()
        where job_id = $1
          and status in ('pending', 'running')
        "#,
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(counts.completed)
    .bind(counts.success)
    .bind(counts.failed)
    .bind(&error)
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() == 0 {
        return Err(StoreError::InvalidState(format!(
            "job {job_id} is already terminal (or missing)"
        )));
    }

    for o in &outcomes {
        sqlx::query(
            r#"
            insert into job_outcomes (job_id, roster_index, account_number, outcome, detail)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(o.roster_index)
        .bind(&o.account_number)
        .bind(o.kind.as_str())
        .bind(&o.detail)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Finalize every job left `pending`/`running` by a previous process as
/// `failed`. The daemon runs this at startup, so a crash mid-run cannot
/// leave a job non-terminal. Returns the number of rows swept.
pub async fn fail_orphaned(pool: &PgPool, reason: &str) -> Result<u64, StoreError> {
    let res = sqlx::query(
        r#"
        update jobs
        set status = 'failed',
            error = $1,
            finished_at = now()
        where status in ('pending', 'running')
        "#,
    )
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(res.rows_affected())
}

/// Fetch one job with its outcomes in roster order.
pub async fn fetch_job(pool: &PgPool, job_id: Uuid) -> Result<JobDetail, StoreError> {
    let row = sqlx::query(
        r#"
        select
          job_id, job_type, status, target_year, target_month, dry_run,
          total_accounts, completed_accounts, success_count, failed_count,
          error, started_at, finished_at, triggered_by
        from jobs
        where job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

    let job = job_from_row(&row)?;

    let outcome_rows = sqlx::query(
        r#"
        select roster_index, account_number, outcome, detail
        from job_outcomes
        where job_id = $1
        order by roster_index asc
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    let mut outcomes = Vec::with_capacity(outcome_rows.len());
    for r in outcome_rows {
        let kind: String = r.try_get("outcome")?;
        outcomes.push(AccountOutcome {
            roster_index: r.try_get("roster_index")?,
            account_number: r.try_get("account_number")?,
            kind: OutcomeKind::parse(&kind)
                .map_err(|e| StoreError::Validation(format!("stored outcome invalid: {e}")))?,
            detail: r.try_get("detail")?,
        });
    }

    Ok(JobDetail { job, outcomes })
}

/// List jobs, most recently started first.
pub async fn list_jobs(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<JobRecord>, StoreError> {
    let limit = if limit > 0 { limit } else { 50 };

    let rows = sqlx::query(
        r#"
        select
          job_id, job_type, status, target_year, target_month, dry_run,
          total_accounts, completed_accounts, success_count, failed_count,
          error, started_at, finished_at, triggered_by
        from jobs
        order by started_at desc, job_id desc
        limit $1 offset $2
        "#,
    )
    .bind(limit)
    .bind(offset.max(0))
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(job_from_row(&r)?);
    }
    Ok(out)
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;

    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        job_type: JobType::parse(&job_type)
            .map_err(|e| StoreError::Validation(format!("stored job_type invalid: {e}")))?,
        status: JobStatus::parse(&status)
            .map_err(|e| StoreError::Validation(format!("stored status invalid: {e}")))?,
        target_year: row.try_get("target_year")?,
        target_month: row.try_get("target_month")?,
        dry_run: row.try_get("dry_run")?,
        counts: JobCounts {
            total: row.try_get("total_accounts")?,
            completed: row.try_get("completed_accounts")?,
            success: row.try_get("success_count")?,
            failed: row.try_get("failed_count")?,
        },
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        triggered_by: row.try_get("triggered_by")?,
    })
}
