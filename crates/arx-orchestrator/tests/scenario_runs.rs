//! End-to-end orchestrator scenarios against in-memory stores and a
//! scripted source adapter.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arx_db::store::{ConfigStore, JobStore, SnapshotFilter, SnapshotStore, StoreError};
use arx_orchestrator::{run_batch, RunDeps, RunRequest};
use arx_schemas::{JobStatus, JobType, LastRunStatus, OutcomeKind, RunScope, TargetPeriod};
use arx_testkit::{MemConfig, MemJobs, MemStore, ScriptedOutcome, ScriptedSource};

const PERIOD: TargetPeriod = TargetPeriod {
    year: 2025,
    month: 10,
};

fn deps(source: ScriptedSource) -> RunDeps {
    RunDeps {
        jobs: Arc::new(MemJobs::new()),
        config: Arc::new(MemConfig::new()),
        source: Arc::new(source),
    }
}

fn manual_all() -> RunRequest {
    RunRequest::manual(PERIOD, RunScope::AllAccounts, "test")
}

#[tokio::test]
async fn all_accounts_succeed_finalizes_completed() {
    let deps = deps(ScriptedSource::new(vec!["620547", "183729"]));
    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.total, 2);
    assert_eq!(report.counts.completed, 2);
    assert_eq!(report.counts.success, 2);
    assert_eq!(report.counts.failed, 0);

    let detail = deps.jobs.fetch_job(report.job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Completed);
    assert!(detail.job.finished_at.is_some());
    assert_eq!(detail.outcomes.len(), 2);
    assert_eq!(detail.outcomes[0].account_number, "620547");
    assert_eq!(detail.outcomes[0].kind, OutcomeKind::Archived);
    assert_eq!(
        detail.outcomes[0].detail.as_deref(),
        Some("620547-202510")
    );
}

#[tokio::test]
async fn one_failing_account_does_not_stop_the_batch() {
    let source = ScriptedSource::new(vec!["a1", "a2", "a3"]).on_account(
        "a2",
        ScriptedOutcome::ComputeFailed("missing rate card".into()),
    );
    let deps = deps(source);
    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::CompletedWithErrors);
    assert_eq!(report.counts.success, 2);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.counts.completed, 3);

    // Outcomes stay in roster order, failure detail attached to the right
    // account.
    let kinds: Vec<_> = report.outcomes.iter().map(|o| o.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OutcomeKind::Archived,
            OutcomeKind::Failed,
            OutcomeKind::Archived
        ]
    );
    assert!(report.outcomes[1]
        .detail
        .as_deref()
        .unwrap()
        .contains("missing rate card"));
}

#[tokio::test]
async fn every_account_failing_finalizes_failed() {
    let source = ScriptedSource::new(vec!["a1", "a2"])
        .on_account("a1", ScriptedOutcome::TransportFailed("timeout".into()))
        .on_account("a2", ScriptedOutcome::ComputeFailed("boom".into()));
    let deps = deps(source);
    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.counts.success, 0);
    assert_eq!(report.counts.failed, 2);
}

#[tokio::test]
async fn rerun_over_archived_periods_reports_duplicates_without_rewriting() {
    let store = Arc::new(MemStore::new());
    let first = deps(ScriptedSource::new(vec!["620547", "183729"]).backed_by(Arc::clone(&store)));
    let report = run_batch(&first, manual_all()).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(store.snapshot_count(), 2);

    // Same roster, same period: everything is already archived.
    let second = deps(ScriptedSource::new(vec!["620547", "183729"]).backed_by(Arc::clone(&store)));
    let report = run_batch(&second, manual_all()).await.unwrap();

    assert_eq!(store.snapshot_count(), 2);
    assert_eq!(report.counts.success, 0);
    assert_eq!(report.counts.failed, 2);
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.kind == OutcomeKind::Duplicate));
    assert_eq!(
        report.outcomes[1].detail.as_deref(),
        Some("183729-202510")
    );
}

#[tokio::test]
async fn dry_run_touches_nothing_and_completes() {
    let store = Arc::new(MemStore::new());
    let source = ScriptedSource::new(vec!["a1", "a2", "a3"]).backed_by(Arc::clone(&store));
    let deps = deps(source);

    let mut req = manual_all();
    req.dry_run = true;
    let report = run_batch(&deps, req).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.success, 3);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.kind == OutcomeKind::WouldProcess));
    assert_eq!(store.snapshot_count(), 0);
}

#[tokio::test]
async fn dry_run_never_calls_compute() {
    let source = Arc::new(ScriptedSource::new(vec!["a1", "a2"]));
    let deps = RunDeps {
        jobs: Arc::new(MemJobs::new()),
        config: Arc::new(MemConfig::new()),
        source: Arc::clone(&source) as _,
    };

    let mut req = manual_all();
    req.dry_run = true;
    let report = run_batch(&deps, req).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(source.compute_calls(), 0);
}

#[tokio::test]
async fn roster_failure_fails_the_whole_run_with_an_error() {
    let deps = deps(ScriptedSource::roster_down("directory returned 503"));
    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.counts.total, 0);
    assert!(report.outcomes.is_empty());

    let detail = deps.jobs.fetch_job(report.job_id).await.unwrap();
    assert_eq!(detail.job.status, JobStatus::Failed);
    assert!(detail
        .job
        .error
        .as_deref()
        .unwrap()
        .contains("directory returned 503"));
}

#[tokio::test]
async fn explicit_scope_skips_roster_resolution() {
    let source = Arc::new(ScriptedSource::roster_down("unused"));
    let deps = RunDeps {
        jobs: Arc::new(MemJobs::new()),
        config: Arc::new(MemConfig::new()),
        source: Arc::clone(&source) as _,
    };

    let req = RunRequest::manual(
        PERIOD,
        RunScope::Accounts(vec!["620547".into()]),
        "operator",
    );
    let report = run_batch(&deps, req).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.total, 1);
    assert_eq!(source.compute_calls(), 1);
}

#[tokio::test]
async fn empty_roster_finalizes_completed_with_zero_totals() {
    let deps = deps(ScriptedSource::new(vec![]));
    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.counts.total, 0);
    assert_eq!(report.counts.completed, 0);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn cancelled_run_records_remaining_accounts_and_still_finalizes() {
    let deps = deps(ScriptedSource::new(vec!["a1", "a2", "a3"]));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut req = manual_all();
    req.cancel = cancel;
    req.concurrency = 1;

    let report = run_batch(&deps, req).await.unwrap();

    // Nothing got through, but the job is terminal and the counts add up.
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.counts.total, 3);
    assert_eq!(report.counts.completed, 3);
    assert_eq!(report.counts.success + report.counts.failed, 3);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.kind == OutcomeKind::Aborted));
}

#[tokio::test]
async fn parallel_completion_order_does_not_reorder_outcomes() {
    // First roster entry is the slowest; with concurrency 4 the others
    // finish first.
    let source = ScriptedSource::new(vec!["slow", "b", "c", "d"])
        .with_delay("slow", Duration::from_millis(50));
    let deps = deps(source);

    let mut req = manual_all();
    req.concurrency = 4;
    let report = run_batch(&deps, req).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    let order: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| o.account_number.as_str())
        .collect();
    assert_eq!(order, vec!["slow", "b", "c", "d"]);
    let indexes: Vec<_> = report.outcomes.iter().map(|o| o.roster_index).collect();
    assert_eq!(indexes, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn scheduled_run_records_last_run_on_config() {
    let deps = deps(
        ScriptedSource::new(vec!["a1", "a2"])
            .on_account("a2", ScriptedOutcome::ComputeFailed("boom".into())),
    );

    let req = RunRequest::scheduled(PERIOD, RunScope::AllAccounts);
    let report = run_batch(&deps, req).await.unwrap();
    assert_eq!(report.status, JobStatus::CompletedWithErrors);

    let cfg = deps.config.load().await.unwrap();
    assert!(cfg.last_run_at.is_some());
    assert_eq!(cfg.last_run_status, LastRunStatus::Partial);
    assert_eq!(cfg.last_run_count, 1);
}

#[tokio::test]
async fn manual_run_leaves_scheduler_last_run_untouched() {
    let deps = deps(ScriptedSource::new(vec!["a1"]));
    run_batch(&deps, manual_all()).await.unwrap();

    let cfg = deps.config.load().await.unwrap();
    assert!(cfg.last_run_at.is_none());
    assert_eq!(cfg.last_run_status, LastRunStatus::NeverRun);
}

#[tokio::test]
async fn job_ledger_lists_newest_run_first() {
    let store = Arc::new(MemStore::new());
    let jobs: Arc<MemJobs> = Arc::new(MemJobs::new());
    let mk = |roster: Vec<&str>| RunDeps {
        jobs: Arc::clone(&jobs) as _,
        config: Arc::new(MemConfig::new()),
        source: Arc::new(ScriptedSource::new(roster).backed_by(Arc::clone(&store))),
    };

    let first = run_batch(&mk(vec!["620547"]), manual_all()).await.unwrap();
    let second = run_batch(&mk(vec!["183729"]), manual_all()).await.unwrap();

    let listed = jobs.list_jobs(10, 0).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].job_id, second.job_id);
    assert_eq!(listed[1].job_id, first.job_id);
    assert_eq!(listed[0].job_type, JobType::Manual);
}

#[tokio::test]
async fn invalid_period_is_rejected_before_any_job_row() {
    let deps = deps(ScriptedSource::new(vec!["a1"]));
    let req = RunRequest::manual(
        TargetPeriod { year: 2025, month: 13 },
        RunScope::AllAccounts,
        "test",
    );
    let job_id = req.job_id;
    assert!(run_batch(&deps, req).await.is_err());
    assert!(deps.jobs.fetch_job(job_id).await.is_err());
}

#[tokio::test]
async fn mixed_two_account_run_archives_only_the_healthy_account() {
    let store = Arc::new(MemStore::new());
    let source = ScriptedSource::new(vec!["620547", "183729"])
        .backed_by(Arc::clone(&store))
        .on_account(
            "183729",
            ScriptedOutcome::ComputeFailed("rate card missing for period".into()),
        );
    let deps = deps(source);

    let report = run_batch(&deps, manual_all()).await.unwrap();

    assert_eq!(report.status, JobStatus::CompletedWithErrors);
    assert_eq!(report.counts.total, 2);
    assert_eq!(report.counts.success, 1);
    assert_eq!(report.counts.failed, 1);

    // Exactly one snapshot made it into the repository.
    assert_eq!(store.snapshot_count(), 1);
    let stored = store.get("620547-202510").await.unwrap();
    assert_eq!(stored.snapshot.account_number, "620547");
    assert!(matches!(
        store.get("183729-202510").await.unwrap_err(),
        StoreError::NotFound(_)
    ));

    // Searching the failed account's archive finds nothing at all.
    let page = store
        .search(SnapshotFilter {
            account: Some("183729".into()),
            ..SnapshotFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    assert!(page.results.is_empty());
}

#[tokio::test]
async fn job_ids_are_unique_per_run() {
    let a = RunRequest::manual(PERIOD, RunScope::AllAccounts, "test");
    let b = RunRequest::manual(PERIOD, RunScope::AllAccounts, "test");
    assert_ne!(a.job_id, b.job_id);
    assert_ne!(a.job_id, Uuid::nil());
}
