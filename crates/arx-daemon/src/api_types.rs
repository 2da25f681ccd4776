//! Request and response types for all arx-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arx_schemas::{SnapshotSummary, TargetPeriod};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Error body
// ---------------------------------------------------------------------------

/// Uniform error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// POST /v1/snapshot (accept)
// ---------------------------------------------------------------------------

/// 409 body when the period is already archived. Carries the existing
/// invoice number so the caller can fetch the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateResponse {
    pub error: String,
    pub invoice_number: String,
}

// ---------------------------------------------------------------------------
// GET /v1/snapshots/search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub account: Option<String>,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: i64,
    pub results: Vec<SnapshotSummary>,
}

// ---------------------------------------------------------------------------
// GET /v1/jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ---------------------------------------------------------------------------
// POST /v1/runs
// ---------------------------------------------------------------------------

/// Manual run trigger. Omitted year/month default to the previous calendar
/// month; an omitted account list means the full roster.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRunRequest {
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub accounts: Option<Vec<String>>,
    #[serde(default)]
    pub dry_run: bool,
}

/// 202 body: the run was accepted and proceeds in the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRunResponse {
    pub job_id: Uuid,
    pub status: &'static str,
    pub target: TargetPeriod,
    pub dry_run: bool,
}
