//! Batch orchestrator: drives one snapshot-creation run over a roster of
//! accounts, isolating per-account failures and recording an auditable job
//! outcome in the ledger.
//!
//! Invariants enforced here:
//! - One compute attempt per account per run; a failing account never aborts
//!   the batch. The only whole-run abort path is roster resolution.
//! - Outcomes are tagged with their roster index and sorted before commit,
//!   so the persisted job record is identical no matter how work was
//!   parallelized.
//! - Every opened job reaches a terminal status exactly once, including on
//!   cancellation.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use arx_db::store::{ConfigStore, JobStore, NewJob};
use arx_schemas::{
    AccountOutcome, JobCounts, JobStatus, JobType, LastRunStatus, OutcomeKind, RunScope,
    TargetPeriod,
};
use arx_source::{SourceAdapter, SourceError};

pub mod schedule;

/// Default bound on in-flight per-account attempts within one run.
pub const DEFAULT_RUN_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Request / dependencies / report
// ---------------------------------------------------------------------------

/// Collaborators a run needs. All shared-state mutation (job ledger,
/// scheduler config) goes through these handles; the orchestrator is the
/// single writer for the job it drives.
#[derive(Clone)]
pub struct RunDeps {
    pub jobs: Arc<dyn JobStore>,
    pub config: Arc<dyn ConfigStore>,
    pub source: Arc<dyn SourceAdapter>,
}

/// One run request, scheduled or manual.
#[derive(Clone)]
pub struct RunRequest {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub period: TargetPeriod,
    pub scope: RunScope,
    pub dry_run: bool,
    pub triggered_by: String,
    /// Worker-pool bound; 1 means strictly serial.
    pub concurrency: usize,
    /// Cooperative abort. Remaining accounts are recorded as `aborted` and
    /// the job is finalized with the accumulated counts.
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn manual(period: TargetPeriod, scope: RunScope, triggered_by: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type: JobType::Manual,
            period,
            scope,
            dry_run: false,
            triggered_by: triggered_by.into(),
            concurrency: DEFAULT_RUN_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    pub fn scheduled(period: TargetPeriod, scope: RunScope) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type: JobType::Scheduled,
            period,
            scope,
            dry_run: false,
            triggered_by: "scheduler".into(),
            concurrency: DEFAULT_RUN_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a finished run, mirroring the finalized ledger row.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub counts: JobCounts,
    pub outcomes: Vec<AccountOutcome>,
}

// ---------------------------------------------------------------------------
// Run driver
// ---------------------------------------------------------------------------

/// Execute one run end to end. The returned error covers ledger/storage
/// faults only; per-account compute failures are recorded outcomes, not
/// errors.
pub async fn run_batch(deps: &RunDeps, req: RunRequest) -> Result<JobReport> {
    if !req.period.is_valid() {
        anyhow::bail!(
            "invalid target period {}-{:02}",
            req.period.year,
            req.period.month
        );
    }

    deps.jobs
        .open_job(NewJob {
            job_id: req.job_id,
            job_type: req.job_type,
            target_year: req.period.year,
            target_month: req.period.month,
            dry_run: req.dry_run,
            triggered_by: req.triggered_by.clone(),
        })
        .await
        .context("open_job failed")?;

    info!(
        job_id = %req.job_id,
        job_type = req.job_type.as_str(),
        year = req.period.year,
        month = req.period.month,
        dry_run = req.dry_run,
        "run opened"
    );

    // Step 1: resolve scope. A roster failure is the only whole-run abort
    // path: pending -> failed with a single aggregate error.
    let roster = match &req.scope {
        RunScope::AllAccounts => match deps.source.list_billable_accounts().await {
            Ok(r) => r,
            Err(e) => {
                let counts = JobCounts::default();
                deps.jobs
                    .finalize_job(
                        req.job_id,
                        JobStatus::Failed,
                        counts,
                        Some(e.to_string()),
                        Vec::new(),
                    )
                    .await
                    .context("finalize_job (roster failure) failed")?;

                warn!(job_id = %req.job_id, error = %e, "roster resolution failed");
                finish_scheduled(deps, &req, JobStatus::Failed, counts).await?;

                return Ok(JobReport {
                    job_id: req.job_id,
                    status: JobStatus::Failed,
                    counts,
                    outcomes: Vec::new(),
                });
            }
        },
        RunScope::Accounts(list) => list.clone(),
    };

    deps.jobs
        .mark_running(req.job_id, roster.len() as i32)
        .await
        .context("mark_running failed")?;

    let result = drive_roster(deps, &req, &roster).await;

    let (counts, outcomes) = match result {
        Ok(v) => v,
        Err(e) => {
            // Ledger fault mid-run: finalize as failed with what we have so
            // the job never stays non-terminal, then surface the fault.
            let _ = deps
                .jobs
                .finalize_job(
                    req.job_id,
                    JobStatus::Failed,
                    JobCounts {
                        total: roster.len() as i32,
                        ..JobCounts::default()
                    },
                    Some(format!("ledger failure: {e}")),
                    Vec::new(),
                )
                .await;
            return Err(e);
        }
    };

    let status = terminal_status(counts);
    deps.jobs
        .finalize_job(req.job_id, status, counts, None, outcomes.clone())
        .await
        .context("finalize_job failed")?;

    info!(
        job_id = %req.job_id,
        status = status.as_str(),
        total = counts.total,
        success = counts.success,
        failed = counts.failed,
        "run finalized"
    );

    finish_scheduled(deps, &req, status, counts).await?;

    Ok(JobReport {
        job_id: req.job_id,
        status,
        counts,
        outcomes,
    })
}

/// Process every roster entry through a bounded worker pool, updating
/// ledger counters incrementally and buffering index-tagged outcomes.
async fn drive_roster(
    deps: &RunDeps,
    req: &RunRequest,
    roster: &[String],
) -> Result<(JobCounts, Vec<AccountOutcome>)> {
    let mut counts = JobCounts {
        total: roster.len() as i32,
        ..JobCounts::default()
    };

    if roster.is_empty() {
        return Ok((counts, Vec::new()));
    }

    let concurrency = req.concurrency.max(1);

    let mut completions = stream::iter(roster.iter().cloned().enumerate().map(|(idx, account)| {
        let source = Arc::clone(&deps.source);
        let cancel = req.cancel.clone();
        let period = req.period;
        let dry_run = req.dry_run;
        async move {
            let (kind, detail) =
                attempt_account(source.as_ref(), &account, period, dry_run, &cancel).await;
            (idx, account, kind, detail)
        }
    }))
    .buffered(concurrency);

    let mut outcomes: Vec<AccountOutcome> = Vec::with_capacity(roster.len());

    while let Some((idx, account, kind, detail)) = completions.next().await {
        if kind.is_success() {
            counts.success += 1;
        } else {
            counts.failed += 1;
        }
        counts.completed += 1;

        outcomes.push(AccountOutcome {
            roster_index: idx as i32,
            account_number: account,
            kind,
            detail,
        });

        deps.jobs
            .update_progress(req.job_id, counts)
            .await
            .context("update_progress failed")?;
    }

    // Completion order is nondeterministic under parallelism; the persisted
    // record is always roster order.
    outcomes.sort_by_key(|o| o.roster_index);

    Ok((counts, outcomes))
}

/// One account's attempt. Never returns an error: every failure mode is a
/// recorded outcome.
async fn attempt_account(
    source: &dyn SourceAdapter,
    account: &str,
    period: TargetPeriod,
    dry_run: bool,
    cancel: &CancellationToken,
) -> (OutcomeKind, Option<String>) {
    if cancel.is_cancelled() {
        return (
            OutcomeKind::Aborted,
            Some("run cancelled before this account was attempted".into()),
        );
    }

    if dry_run {
        return (OutcomeKind::WouldProcess, None);
    }

    match source
        .compute_and_accept(account, period.year, period.month)
        .await
    {
        Ok(receipt) => (OutcomeKind::Archived, Some(receipt.invoice_number)),
        Err(SourceError::Duplicate { invoice_number }) => {
            (OutcomeKind::Duplicate, Some(invoice_number))
        }
        Err(e) => {
            warn!(account, error = %e, "account compute failed");
            (OutcomeKind::Failed, Some(e.to_string()))
        }
    }
}

/// Terminal status per the run state machine. An empty roster finalizes as
/// completed with all counts zero.
fn terminal_status(counts: JobCounts) -> JobStatus {
    if counts.failed == 0 {
        JobStatus::Completed
    } else if counts.success > 0 {
        JobStatus::CompletedWithErrors
    } else {
        JobStatus::Failed
    }
}

/// Last step for scheduled jobs only: write the config's last-run fields,
/// after the job itself is terminal.
async fn finish_scheduled(
    deps: &RunDeps,
    req: &RunRequest,
    status: JobStatus,
    counts: JobCounts,
) -> Result<()> {
    if req.job_type != JobType::Scheduled {
        return Ok(());
    }

    deps.config
        .record_last_run(
            Utc::now(),
            LastRunStatus::from_job_status(status),
            counts.success,
        )
        .await
        .context("record_last_run failed")?;

    Ok(())
}
