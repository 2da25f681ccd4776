//! Shared runtime state for arx-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Storage is reached
//! through the trait objects from `arx-db`, never through a pool directly,
//! so the scenario tests in `tests/` can run the full router against the
//! in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use arx_db::store::{ConfigStore, JobStore, SnapshotStore};
use arx_orchestrator::{run_batch, schedule, RunDeps, RunRequest, DEFAULT_RUN_CONCURRENCY};
use arx_schemas::RunScope;
use arx_source::SourceAdapter;

pub const ENV_DAEMON_ADDR: &str = "ARX_DAEMON_ADDR";
pub const ENV_RUN_CONCURRENCY: &str = "ARX_RUN_CONCURRENCY";

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in the health response.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub snapshots: Arc<dyn SnapshotStore>,
    pub jobs: Arc<dyn JobStore>,
    pub config: Arc<dyn ConfigStore>,
    pub source: Arc<dyn SourceAdapter>,
    /// Held for the duration of a run; `try_lock` failing means a run is
    /// already in flight and a second trigger is refused.
    pub run_guard: Arc<Mutex<()>>,
    /// Process-wide shutdown token. Every run borrows a child token from
    /// it, so cancelling here aborts the in-flight run and lets it finalize
    /// with `aborted` outcomes before the process exits.
    pub shutdown: CancellationToken,
    pub run_concurrency: usize,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        jobs: Arc<dyn JobStore>,
        config: Arc<dyn ConfigStore>,
        source: Arc<dyn SourceAdapter>,
        run_concurrency: usize,
    ) -> Self {
        Self {
            snapshots,
            jobs,
            config,
            source,
            run_guard: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
            run_concurrency,
            build: BuildInfo {
                service: "arx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    pub fn run_deps(&self) -> RunDeps {
        RunDeps {
            jobs: Arc::clone(&self.jobs),
            config: Arc::clone(&self.config),
            source: Arc::clone(&self.source),
        }
    }
}

pub fn run_concurrency_from_env() -> usize {
    std::env::var(ENV_RUN_CONCURRENCY)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n >= 1)
        .unwrap_or(DEFAULT_RUN_CONCURRENCY)
}

// ---------------------------------------------------------------------------
// Scheduler tick
// ---------------------------------------------------------------------------

/// Background loop evaluating the scheduler policy. Fires at most one run
/// per configured window; a manual run already in flight makes the tick
/// skip (the suppression check will retry on the next tick within the same
/// window).
pub fn spawn_scheduler_tick(state: Arc<AppState>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if state.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = scheduler_tick_once(&state).await {
                error!(error = ?e, "scheduler tick failed");
            }
        }
    });
}

async fn scheduler_tick_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let now = Utc::now();
    let config = state.config.load().await?;
    if !schedule::should_run(&config, now) {
        return Ok(());
    }

    let Ok(guard) = Arc::clone(&state.run_guard).try_lock_owned() else {
        warn!("scheduled window reached but a run is already in flight");
        return Ok(());
    };

    let period = schedule::resolve_target_period(&config, now);
    let scope = RunScope::AllAccounts;

    let mut req = RunRequest::scheduled(period, scope);
    req.concurrency = state.run_concurrency;
    req.cancel = state.shutdown.child_token();

    info!(
        job_id = %req.job_id,
        year = period.year,
        month = period.month,
        "scheduled run triggered"
    );

    let deps = state.run_deps();
    let report = run_batch(&deps, req).await;
    drop(guard);

    match report {
        Ok(report) => {
            info!(
                job_id = %report.job_id,
                status = report.status.as_str(),
                "scheduled run finished"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}
