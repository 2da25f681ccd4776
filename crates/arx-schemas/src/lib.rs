//! Shared data model for the billing snapshot archive.
//!
//! Pure serde types only — no persistence, no HTTP. Every other crate in the
//! workspace builds on these definitions so the repository, orchestrator,
//! daemon and CLI all agree on field names and status vocabularies.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invoice identity
// ---------------------------------------------------------------------------

/// Deterministic invoice identifier for one (account, year, month) period.
///
/// This string is the enforced uniqueness key in the repository; deriving it
/// here (and nowhere else) keeps manual accepts and orchestrated accepts on
/// the same key.
pub fn invoice_number(account: &str, year: i32, month: i32) -> String {
    format!("{account}-{year}{month:02}")
}

// ---------------------------------------------------------------------------
// Snapshot + line items
// ---------------------------------------------------------------------------

/// Categorical line item kind, denormalized from the billing breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    User,
    Asset,
    Backup,
    Ticket,
    Custom,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::User => "user",
            LineType::Asset => "asset",
            LineType::Backup => "backup",
            LineType::Ticket => "ticket",
            LineType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(LineType::User),
            "asset" => Ok(LineType::Asset),
            "backup" => Ok(LineType::Backup),
            "ticket" => Ok(LineType::Ticket),
            "custom" => Ok(LineType::Custom),
            other => Err(anyhow!("invalid line type: {}", other)),
        }
    }
}

/// One denormalized line of a snapshot, searchable without deserializing the
/// full billing breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub line_type: LineType,
    pub item_name: String,
    pub description: Option<String>,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
}

/// Payload for creating a snapshot. `archived_at` is assigned by the
/// repository at accept time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub invoice_number: String,
    pub account_number: String,
    pub company_name: String,
    pub billing_year: i32,
    pub billing_month: i32,
    pub total_amount: f64,
    /// Complete billing breakdown, owned by the source adapter. Stored
    /// verbatim; the archive never interprets it.
    pub billing_data: Value,
    pub invoice_csv: String,
    pub created_by: String,
    pub notes: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

/// A stored, immutable snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub invoice_number: String,
    pub account_number: String,
    pub company_name: String,
    pub billing_year: i32,
    pub billing_month: i32,
    pub total_amount: f64,
    pub billing_data: Value,
    pub invoice_csv: String,
    pub archived_at: DateTime<Utc>,
    pub created_by: String,
    pub notes: Option<String>,
}

/// A snapshot together with all of its line items. `get` never returns one
/// without the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotWithItems {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub line_items: Vec<LineItem>,
}

/// Listing row for search results and per-account history (no blob fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub invoice_number: String,
    pub account_number: String,
    pub company_name: String,
    pub billing_year: i32,
    pub billing_month: i32,
    pub total_amount: f64,
    pub archived_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Target period + scope
// ---------------------------------------------------------------------------

/// Billing period a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPeriod {
    pub year: i32,
    pub month: i32,
}

impl TargetPeriod {
    /// Calendar month containing `now`.
    pub fn current(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month() as i32,
        }
    }

    /// Calendar month before `now`, wrapping the year at January.
    pub fn previous(now: DateTime<Utc>) -> Self {
        if now.month() == 1 {
            Self {
                year: now.year() - 1,
                month: 12,
            }
        } else {
            Self {
                year: now.year(),
                month: now.month() as i32 - 1,
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month) && self.year > 0
    }
}

/// Account scope of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    /// Full roster, resolved through the source adapter at run start.
    AllAccounts,
    /// Explicit account list, processed in the given order.
    Accounts(Vec<String>),
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scheduled,
    Manual,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scheduled => "scheduled",
            JobType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(JobType::Scheduled),
            "manual" => Ok(JobType::Manual),
            other => Err(anyhow!("invalid job type: {}", other)),
        }
    }
}

/// Job state machine: `pending -> running -> {completed |
/// completed_with_errors | failed}`, plus `pending -> failed` when the roster
/// itself cannot be resolved. Terminal states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow!("invalid job status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

/// Per-account outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Snapshot created and persisted for this period.
    Archived,
    /// Period was already archived; benign, recorded distinctly from errors.
    Duplicate,
    /// Compute or transport failure isolated to this account.
    Failed,
    /// Dry-run placeholder; no repository write occurred.
    WouldProcess,
    /// Run was cancelled before this account was attempted.
    Aborted,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Archived => "archived",
            OutcomeKind::Duplicate => "duplicate",
            OutcomeKind::Failed => "failed",
            OutcomeKind::WouldProcess => "would_process",
            OutcomeKind::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "archived" => Ok(OutcomeKind::Archived),
            "duplicate" => Ok(OutcomeKind::Duplicate),
            "failed" => Ok(OutcomeKind::Failed),
            "would_process" => Ok(OutcomeKind::WouldProcess),
            "aborted" => Ok(OutcomeKind::Aborted),
            other => Err(anyhow!("invalid outcome kind: {}", other)),
        }
    }

    /// Archived and would-process count toward the success counter; everything
    /// else counts toward failed.
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Archived | OutcomeKind::WouldProcess)
    }
}

/// One account's recorded outcome within a job, tagged with its roster index
/// so parallel execution strategies cannot reorder the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOutcome {
    pub roster_index: i32,
    pub account_number: String,
    pub kind: OutcomeKind,
    pub detail: Option<String>,
}

/// Job progress counters. For every finalized job:
/// `success + failed == completed == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: i32,
    pub completed: i32,
    pub success: i32,
    pub failed: i32,
}

impl JobCounts {
    pub fn is_consistent(&self) -> bool {
        self.success + self.failed == self.completed
    }
}

/// One orchestration run, as recorded in the job ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub target_year: i32,
    pub target_month: i32,
    pub dry_run: bool,
    pub counts: JobCounts,
    /// Run-level error (roster resolution failure), not per-account detail.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub triggered_by: String,
}

/// Job record plus its ordered per-account outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: JobRecord,
    pub outcomes: Vec<AccountOutcome>,
}

// ---------------------------------------------------------------------------
// Scheduler config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    Success,
    Partial,
    Failed,
    #[serde(rename = "never-run")]
    NeverRun,
}

impl LastRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastRunStatus::Success => "success",
            LastRunStatus::Partial => "partial",
            LastRunStatus::Failed => "failed",
            LastRunStatus::NeverRun => "never-run",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(LastRunStatus::Success),
            "partial" => Ok(LastRunStatus::Partial),
            "failed" => Ok(LastRunStatus::Failed),
            "never-run" => Ok(LastRunStatus::NeverRun),
            other => Err(anyhow!("invalid last-run status: {}", other)),
        }
    }

    /// Collapse a terminal job status into the config's last-run field.
    pub fn from_job_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => LastRunStatus::Success,
            JobStatus::CompletedWithErrors => LastRunStatus::Partial,
            _ => LastRunStatus::Failed,
        }
    }
}

/// Singleton scheduling policy. Policy fields are replaced whole-object by
/// operators; the last-run fields are written only by the orchestrator when a
/// scheduled job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 1-31
    pub day_of_month: i32,
    /// 0-23
    pub hour: i32,
    /// Target the month before the trigger time (wrapping the year).
    pub snapshot_previous_month: bool,
    /// Resolve the full roster; when false the scope comes from an explicit
    /// list supplied by an external collaborator.
    pub snapshot_all_accounts: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: LastRunStatus,
    pub last_run_count: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        // 1st of the month at 02:00 UTC, archive the previous month, all accounts.
        Self {
            enabled: true,
            day_of_month: 1,
            hour: 2,
            snapshot_previous_month: true,
            snapshot_all_accounts: true,
            last_run_at: None,
            last_run_status: LastRunStatus::NeverRun,
            last_run_count: 0,
            updated_at: None,
        }
    }
}

/// Operator-supplied replacement for the policy fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfigUpdate {
    pub enabled: bool,
    pub day_of_month: i32,
    pub hour: i32,
    pub snapshot_previous_month: bool,
    pub snapshot_all_accounts: bool,
}

impl SchedulerConfigUpdate {
    pub fn validate(&self) -> Result<()> {
        if !(1..=31).contains(&self.day_of_month) {
            return Err(anyhow!(
                "day_of_month must be 1-31, got {}",
                self.day_of_month
            ));
        }
        if !(0..=23).contains(&self.hour) {
            return Err(anyhow!("hour must be 0-23, got {}", self.hour));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn invoice_number_zero_pads_month() {
        assert_eq!(invoice_number("620547", 2025, 10), "620547-202510");
        assert_eq!(invoice_number("620547", 2025, 3), "620547-202503");
    }

    #[test]
    fn previous_period_wraps_january() {
        let jan = Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(
            TargetPeriod::previous(jan),
            TargetPeriod {
                year: 2025,
                month: 12
            }
        );

        let jul = Utc.with_ymd_and_hms(2025, 7, 1, 2, 0, 0).unwrap();
        assert_eq!(
            TargetPeriod::previous(jul),
            TargetPeriod {
                year: 2025,
                month: 6
            }
        );
    }

    #[test]
    fn job_status_roundtrip_and_terminality() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::CompletedWithErrors.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn outcome_kind_success_classification() {
        assert!(OutcomeKind::Archived.is_success());
        assert!(OutcomeKind::WouldProcess.is_success());
        assert!(!OutcomeKind::Duplicate.is_success());
        assert!(!OutcomeKind::Failed.is_success());
        assert!(!OutcomeKind::Aborted.is_success());
    }

    #[test]
    fn last_run_status_from_job_status() {
        assert_eq!(
            LastRunStatus::from_job_status(JobStatus::Completed),
            LastRunStatus::Success
        );
        assert_eq!(
            LastRunStatus::from_job_status(JobStatus::CompletedWithErrors),
            LastRunStatus::Partial
        );
        assert_eq!(
            LastRunStatus::from_job_status(JobStatus::Failed),
            LastRunStatus::Failed
        );
    }

    #[test]
    fn scheduler_update_rejects_out_of_range() {
        let mut u = SchedulerConfigUpdate {
            enabled: true,
            day_of_month: 1,
            hour: 2,
            snapshot_previous_month: true,
            snapshot_all_accounts: true,
        };
        assert!(u.validate().is_ok());
        u.day_of_month = 32;
        assert!(u.validate().is_err());
        u.day_of_month = 1;
        u.hour = 24;
        assert!(u.validate().is_err());
    }
}
