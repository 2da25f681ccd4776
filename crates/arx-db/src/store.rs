//! Storage contract shared by the Postgres implementation and the in-memory
//! test doubles.
//!
//! The orchestrator and daemon depend on these traits, never on `PgPool`
//! directly, so the run state machine and the HTTP surface are testable
//! without a live database. [`PgStore`] is the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use arx_schemas::{
    AccountOutcome, JobCounts, JobDetail, JobRecord, JobStatus, LastRunStatus, NewSnapshot,
    SchedulerConfig, SchedulerConfigUpdate, Snapshot, SnapshotSummary, SnapshotWithItems,
};

use crate::{jobs, scheduler, snapshots};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Storage-level failures. `Duplicate` and `Validation` are control flow for
/// callers (conflict vs bad-request, benign duplicate vs compute error);
/// `Db` is an operational fault.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed input to put/accept — caller's fault, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A snapshot already exists for this (account, year, month) period.
    #[error("snapshot already archived: {invoice_number}")]
    Duplicate { invoice_number: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine violation, e.g. finalizing an already-terminal job.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Append-only snapshot repository. No update or delete exists in this
/// contract — immutability is structural.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot and all of its line items atomically. Fails with
    /// [`StoreError::Duplicate`] when the period is already archived and
    /// [`StoreError::Validation`] before any write on malformed input.
    async fn put(&self, snap: NewSnapshot) -> Result<Snapshot, StoreError>;

    /// Fetch one snapshot with all of its line items.
    async fn get(&self, invoice_number: &str) -> Result<SnapshotWithItems, StoreError>;

    /// Filtered search, reverse-chronological by archival timestamp.
    async fn search(&self, filter: SnapshotFilter) -> Result<SnapshotPage, StoreError>;

    /// Per-account history, newest billing period first.
    async fn list_for_account(&self, account: &str) -> Result<Vec<SnapshotSummary>, StoreError>;
}

/// Filters for [`SnapshotStore::search`]. Pagination is a boundary concern;
/// the ordering contract is the repository's.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub account: Option<String>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotPage {
    /// Total matches ignoring limit/offset.
    pub total: i64,
    pub results: Vec<SnapshotSummary>,
}

/// New job row opened at run start. Counts start at zero; the roster size is
/// recorded by `mark_running` once the adapter has resolved it.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub job_type: arx_schemas::JobType,
    pub target_year: i32,
    pub target_month: i32,
    pub dry_run: bool,
    pub triggered_by: String,
}

/// Durable record of orchestration runs. All mutation goes through the
/// orchestrator — a single writer per job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn open_job(&self, job: NewJob) -> Result<(), StoreError>;

    /// `pending -> running`, recording the resolved roster size.
    async fn mark_running(&self, job_id: Uuid, total: i32) -> Result<(), StoreError>;

    /// Incremental counter update while the job is running.
    async fn update_progress(&self, job_id: Uuid, counts: JobCounts) -> Result<(), StoreError>;

    /// Transition to a terminal status exactly once, persisting final counts
    /// and the roster-ordered outcome list. Rejects a second finalize.
    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: JobCounts,
        error: Option<String>,
        outcomes: Vec<AccountOutcome>,
    ) -> Result<(), StoreError>;

    async fn fetch_job(&self, job_id: Uuid) -> Result<JobDetail, StoreError>;

    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError>;
}

/// The singleton scheduler policy row.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<SchedulerConfig, StoreError>;

    /// Whole-object replacement of the policy fields; last-run fields are
    /// preserved.
    async fn replace(&self, update: SchedulerConfigUpdate) -> Result<SchedulerConfig, StoreError>;

    /// Written only by the orchestrator after a scheduled job is terminal.
    async fn record_last_run(
        &self,
        at: DateTime<Utc>,
        status: LastRunStatus,
        count: i32,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// Production storage backed by a Postgres pool. Delegates to the free
/// functions in [`crate::snapshots`], [`crate::jobs`] and
/// [`crate::scheduler`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn put(&self, snap: NewSnapshot) -> Result<Snapshot, StoreError> {
        snapshots::put(&self.pool, snap).await
    }

    async fn get(&self, invoice_number: &str) -> Result<SnapshotWithItems, StoreError> {
        snapshots::get(&self.pool, invoice_number).await
    }

    async fn search(&self, filter: SnapshotFilter) -> Result<SnapshotPage, StoreError> {
        snapshots::search(&self.pool, filter).await
    }

    async fn list_for_account(&self, account: &str) -> Result<Vec<SnapshotSummary>, StoreError> {
        snapshots::list_for_account(&self.pool, account).await
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn open_job(&self, job: NewJob) -> Result<(), StoreError> {
        jobs::open_job(&self.pool, &job).await
    }

    async fn mark_running(&self, job_id: Uuid, total: i32) -> Result<(), StoreError> {
        jobs::mark_running(&self.pool, job_id, total).await
    }

    async fn update_progress(&self, job_id: Uuid, counts: JobCounts) -> Result<(), StoreError> {
        jobs::update_progress(&self.pool, job_id, counts).await
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: JobCounts,
        error: Option<String>,
        outcomes: Vec<AccountOutcome>,
    ) -> Result<(), StoreError> {
        jobs::finalize_job(&self.pool, job_id, status, counts, error, outcomes).await
    }

    async fn fetch_job(&self, job_id: Uuid) -> Result<JobDetail, StoreError> {
        jobs::fetch_job(&self.pool, job_id).await
    }

    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError> {
        jobs::list_jobs(&self.pool, limit, offset).await
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn load(&self) -> Result<SchedulerConfig, StoreError> {
        scheduler::load(&self.pool).await
    }

    async fn replace(&self, update: SchedulerConfigUpdate) -> Result<SchedulerConfig, StoreError> {
        scheduler::replace(&self.pool, update).await
    }

    async fn record_last_run(
        &self,
        at: DateTime<Utc>,
        status: LastRunStatus,
        count: i32,
    ) -> Result<(), StoreError> {
        scheduler::record_last_run(&self.pool, at, status, count).await
    }
}
