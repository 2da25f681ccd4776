//! In-memory storage trait implementations. Semantics mirror the Postgres
//! versions: same validation, same duplicate detection, same job
//! state-machine guards, same result ordering.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use arx_db::snapshots::validate_new_snapshot;
use arx_db::store::{
    ConfigStore, JobStore, NewJob, SnapshotFilter, SnapshotPage, SnapshotStore, StoreError,
};
use arx_schemas::{
    AccountOutcome, JobCounts, JobDetail, JobRecord, JobStatus, LastRunStatus, LineItem,
    NewSnapshot, SchedulerConfig, SchedulerConfigUpdate, Snapshot, SnapshotSummary,
    SnapshotWithItems,
};

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// In-memory snapshot repository. Insertion order doubles as archival order;
/// ties on `archived_at` are broken the same way the production queries do.
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<Vec<(Snapshot, Vec<LineItem>)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

fn summary_of(snap: &Snapshot) -> SnapshotSummary {
    SnapshotSummary {
        invoice_number: snap.invoice_number.clone(),
        account_number: snap.account_number.clone(),
        company_name: snap.company_name.clone(),
        billing_year: snap.billing_year,
        billing_month: snap.billing_month,
        total_amount: snap.total_amount,
        archived_at: snap.archived_at,
    }
}

#[async_trait]
impl SnapshotStore for MemStore {
    async fn put(&self, snap: NewSnapshot) -> Result<Snapshot, StoreError> {
        validate_new_snapshot(&snap)?;

        let mut rows = self.rows.lock().unwrap();
        let clash = rows.iter().any(|(existing, _)| {
            existing.invoice_number == snap.invoice_number
                || (existing.account_number == snap.account_number
                    && existing.billing_year == snap.billing_year
                    && existing.billing_month == snap.billing_month)
        });
        if clash {
            return Err(StoreError::Duplicate {
                invoice_number: snap.invoice_number,
            });
        }

        let stored = Snapshot {
            invoice_number: snap.invoice_number,
            account_number: snap.account_number,
            company_name: snap.company_name,
            billing_year: snap.billing_year,
            billing_month: snap.billing_month,
            total_amount: snap.total_amount,
            billing_data: snap.billing_data,
            invoice_csv: snap.invoice_csv,
            archived_at: Utc::now(),
            created_by: snap.created_by,
            notes: snap.notes,
        };
        rows.push((stored.clone(), snap.line_items));
        Ok(stored)
    }

    async fn get(&self, invoice_number: &str) -> Result<SnapshotWithItems, StoreError> {
        let rows = self.rows.lock().unwrap();
        rows.iter()
            .find(|(s, _)| s.invoice_number == invoice_number)
            .map(|(s, items)| SnapshotWithItems {
                snapshot: s.clone(),
                line_items: items.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(format!("snapshot {invoice_number}")))
    }

    async fn search(&self, filter: SnapshotFilter) -> Result<SnapshotPage, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matches: Vec<&Snapshot> = rows
            .iter()
            .map(|(s, _)| s)
            .filter(|s| {
                filter
                    .account
                    .as_deref()
                    .map_or(true, |a| s.account_number == a)
                    && filter.year.map_or(true, |y| s.billing_year == y)
                    && filter.month.map_or(true, |m| s.billing_month == m)
            })
            .collect();

        matches.sort_by(|a, b| {
            b.archived_at
                .cmp(&a.archived_at)
                .then(b.invoice_number.cmp(&a.invoice_number))
        });

        let total = matches.len() as i64;
        let limit = if filter.limit > 0 { filter.limit } else { 100 } as usize;
        let offset = filter.offset.max(0) as usize;
        let results = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(summary_of)
            .collect();

        Ok(SnapshotPage { total, results })
    }

    async fn list_for_account(&self, account: &str) -> Result<Vec<SnapshotSummary>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut matches: Vec<&Snapshot> = rows
            .iter()
            .map(|(s, _)| s)
            .filter(|s| s.account_number == account)
            .collect();

        matches.sort_by(|a, b| {
            b.billing_year
                .cmp(&a.billing_year)
                .then(b.billing_month.cmp(&a.billing_month))
        });

        Ok(matches.into_iter().map(summary_of).collect())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Default)]
struct JobsInner {
    rows: HashMap<Uuid, JobDetail>,
    /// Insertion order, oldest first.
    order: Vec<Uuid>,
}

/// In-memory job ledger with the same monotonic-transition guards as the
/// Postgres implementation.
#[derive(Default)]
pub struct MemJobs {
    inner: Mutex<JobsInner>,
}

impl MemJobs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemJobs {
    async fn open_job(&self, job: NewJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.contains_key(&job.job_id) {
            return Err(StoreError::InvalidState(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        let record = JobRecord {
            job_id: job.job_id,
            job_type: job.job_type,
            status: JobStatus::Pending,
            target_year: job.target_year,
            target_month: job.target_month,
            dry_run: job.dry_run,
            counts: JobCounts::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            triggered_by: job.triggered_by,
        };
        inner.rows.insert(
            job.job_id,
            JobDetail {
                job: record,
                outcomes: Vec::new(),
            },
        );
        inner.order.push(job.job_id);
        Ok(())
    }

    async fn mark_running(&self, job_id: Uuid, total: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let detail = inner
            .rows
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if detail.job.status != JobStatus::Pending {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {}, expected pending",
                detail.job.status.as_str()
            )));
        }
        detail.job.status = JobStatus::Running;
        detail.job.counts.total = total;
        Ok(())
    }

    async fn update_progress(&self, job_id: Uuid, counts: JobCounts) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let detail = inner
            .rows
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if detail.job.status != JobStatus::Running {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {}, expected running",
                detail.job.status.as_str()
            )));
        }
        detail.job.counts = counts;
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counts: JobCounts,
        error: Option<String>,
        outcomes: Vec<AccountOutcome>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "{} is not a terminal status",
                status.as_str()
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let detail = inner
            .rows
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if detail.job.status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} already finalized as {}",
                detail.job.status.as_str()
            )));
        }
        detail.job.status = status;
        detail.job.counts = counts;
        detail.job.error = error;
        detail.job.finished_at = Some(Utc::now());
        detail.outcomes = outcomes;
        Ok(())
    }

    async fn fetch_job(&self, job_id: Uuid) -> Result<JobDetail, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .rows
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let limit = if limit > 0 { limit } else { 50 } as usize;
        let offset = offset.max(0) as usize;
        // Newest first.
        Ok(inner
            .order
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| inner.rows.get(id))
            .map(|d| d.job.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Scheduler config
// ---------------------------------------------------------------------------

/// In-memory singleton scheduler policy.
pub struct MemConfig {
    inner: Mutex<SchedulerConfig>,
}

impl MemConfig {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerConfig::default()),
        }
    }

    pub fn with(config: SchedulerConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }
}

impl Default for MemConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemConfig {
    async fn load(&self) -> Result<SchedulerConfig, StoreError> {
        Ok(self.inner.lock().unwrap().clone())
    }

    async fn replace(&self, update: SchedulerConfigUpdate) -> Result<SchedulerConfig, StoreError> {
        update
            .validate()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let mut cfg = self.inner.lock().unwrap();
        cfg.enabled = update.enabled;
        cfg.day_of_month = update.day_of_month;
        cfg.hour = update.hour;
        cfg.snapshot_previous_month = update.snapshot_previous_month;
        cfg.snapshot_all_accounts = update.snapshot_all_accounts;
        cfg.updated_at = Some(Utc::now());
        Ok(cfg.clone())
    }

    async fn record_last_run(
        &self,
        at: DateTime<Utc>,
        status: LastRunStatus,
        count: i32,
    ) -> Result<(), StoreError> {
        let mut cfg = self.inner.lock().unwrap();
        cfg.last_run_at = Some(at);
        cfg.last_run_status = status;
        cfg.last_run_count = count;
        Ok(())
    }
}
