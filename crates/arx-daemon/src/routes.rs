//! Axum router and all HTTP handlers for arx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.  All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use arx_db::store::{ConfigStore, JobStore, SnapshotFilter, SnapshotStore, StoreError};
use arx_orchestrator::{run_batch, RunRequest};
use arx_schemas::{NewSnapshot, RunScope, SchedulerConfigUpdate, TargetPeriod};

use crate::{
    api_types::{
        DuplicateResponse, ErrorResponse, HealthResponse, PageQuery, SearchQuery, SearchResponse,
        TriggerRunRequest, TriggerRunResponse,
    },
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/snapshot", post(accept_snapshot))
        .route("/v1/snapshot/:invoice", get(get_snapshot))
        .route("/v1/snapshot/:invoice/csv", get(download_csv))
        .route("/v1/snapshots/search", get(search_snapshots))
        .route("/v1/snapshots/account/:account", get(account_history))
        .route(
            "/v1/scheduler/config",
            get(scheduler_get).put(scheduler_put),
        )
        .route("/v1/runs", post(trigger_run))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/:job_id", get(get_job))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map storage failures onto HTTP statuses. Duplicates get a dedicated body
/// carrying the invoice number of the already-archived period.
fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg })).into_response()
        }
        StoreError::Duplicate { invoice_number } => (
            StatusCode::CONFLICT,
            Json(DuplicateResponse {
                error: "a snapshot already exists for this billing period".to_string(),
                invoice_number,
            }),
        )
            .into_response(),
        StoreError::NotFound(msg) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse { error: msg })).into_response()
        }
        StoreError::InvalidState(msg) => {
            (StatusCode::CONFLICT, Json(ErrorResponse { error: msg })).into_response()
        }
        StoreError::Db(e) => {
            error!(error = ?e, "storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "storage failure".to_string(),
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/snapshot
// ---------------------------------------------------------------------------

/// Accept endpoint the billing-compute service pushes finished snapshots to.
/// 201 on first write, 409 forever after for the same (account, period).
pub(crate) async fn accept_snapshot(
    State(st): State<Arc<AppState>>,
    Json(snap): Json<NewSnapshot>,
) -> Response {
    match st.snapshots.put(snap).await {
        Ok(stored) => {
            info!(invoice = %stored.invoice_number, "snapshot archived");
            (StatusCode::CREATED, Json(stored)).into_response()
        }
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/snapshot/:invoice
// ---------------------------------------------------------------------------

pub(crate) async fn get_snapshot(
    State(st): State<Arc<AppState>>,
    Path(invoice): Path<String>,
) -> Response {
    match st.snapshots.get(&invoice).await {
        Ok(snap) => (StatusCode::OK, Json(snap)).into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/snapshot/:invoice/csv
// ---------------------------------------------------------------------------

/// Download the invoice CSV exactly as stored at archive time.
pub(crate) async fn download_csv(
    State(st): State<Arc<AppState>>,
    Path(invoice): Path<String>,
) -> Response {
    let snap = match st.snapshots.get(&invoice).await {
        Ok(snap) => snap,
        Err(e) => return store_error(e),
    };

    let filename = format!("{}.csv", sanitize_filename(&snap.snapshot.invoice_number));
    let disposition = format!("attachment; filename=\"{filename}\"");

    let mut resp = (StatusCode::OK, snap.snapshot.invoice_csv).into_response();
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));
    if let Ok(v) = HeaderValue::from_str(&disposition) {
        resp.headers_mut().insert(header::CONTENT_DISPOSITION, v);
    }
    resp
}

/// Keep only characters safe inside a quoted filename.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// GET /v1/snapshots/search
// ---------------------------------------------------------------------------

pub(crate) async fn search_snapshots(
    State(st): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> Response {
    let filter = SnapshotFilter {
        account: q.account,
        year: q.year,
        month: q.month,
        limit: q.limit.unwrap_or(0),
        offset: q.offset.unwrap_or(0),
    };
    match st.snapshots.search(filter).await {
        Ok(page) => (
            StatusCode::OK,
            Json(SearchResponse {
                total: page.total,
                results: page.results,
            }),
        )
            .into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/snapshots/account/:account
// ---------------------------------------------------------------------------

pub(crate) async fn account_history(
    State(st): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Response {
    match st.snapshots.list_for_account(&account).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET / PUT /v1/scheduler/config
// ---------------------------------------------------------------------------

pub(crate) async fn scheduler_get(State(st): State<Arc<AppState>>) -> Response {
    match st.config.load().await {
        Ok(cfg) => (StatusCode::OK, Json(cfg)).into_response(),
        Err(e) => store_error(e),
    }
}

pub(crate) async fn scheduler_put(
    State(st): State<Arc<AppState>>,
    Json(update): Json<SchedulerConfigUpdate>,
) -> Response {
    match st.config.replace(update).await {
        Ok(cfg) => (StatusCode::OK, Json(cfg)).into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/runs
// ---------------------------------------------------------------------------

/// Trigger a manual run. Accepted runs proceed in the background; a second
/// trigger while one is in flight is refused with 409 so overlapping runs
/// cannot double-process the roster.
pub(crate) async fn trigger_run(
    State(st): State<Arc<AppState>>,
    Json(body): Json<TriggerRunRequest>,
) -> Response {
    let period = match (body.year, body.month) {
        (Some(y), Some(m)) => TargetPeriod { year: y, month: m },
        (None, None) => TargetPeriod::previous(Utc::now()),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "year and month must be supplied together".to_string(),
                }),
            )
                .into_response()
        }
    };
    if !period.is_valid() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid target period {}-{:02}", period.year, period.month),
            }),
        )
            .into_response();
    }

    let Ok(guard) = Arc::clone(&st.run_guard).try_lock_owned() else {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "a run is already in progress".to_string(),
            }),
        )
            .into_response();
    };

    let scope = match body.accounts {
        Some(accounts) if !accounts.is_empty() => RunScope::Accounts(accounts),
        _ => RunScope::AllAccounts,
    };

    let mut req = RunRequest::manual(period, scope, "api");
    req.dry_run = body.dry_run;
    req.concurrency = st.run_concurrency;
    req.cancel = st.shutdown.child_token();
    let job_id = req.job_id;
    let dry_run = req.dry_run;

    let deps = st.run_deps();
    tokio::spawn(async move {
        let _guard = guard;
        match run_batch(&deps, req).await {
            Ok(report) => info!(
                job_id = %report.job_id,
                status = report.status.as_str(),
                "manual run finished"
            ),
            Err(e) => error!(job_id = %job_id, error = ?e, "manual run failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(TriggerRunResponse {
            job_id,
            status: "accepted",
            target: period,
            dry_run,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/jobs
// ---------------------------------------------------------------------------

pub(crate) async fn list_jobs(
    State(st): State<Arc<AppState>>,
    Query(q): Query<PageQuery>,
) -> Response {
    match st
        .jobs
        .list_jobs(q.limit.unwrap_or(0), q.offset.unwrap_or(0))
        .await
    {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => store_error(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/jobs/:job_id
// ---------------------------------------------------------------------------

pub(crate) async fn get_job(
    State(st): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match st.jobs.fetch_job(job_id).await {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => store_error(e),
    }
}
