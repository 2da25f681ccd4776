//! In-process scenario tests for arx-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` against the in-memory stores and
//! drives it via `tower::ServiceExt::oneshot` — no network or database
//! required.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

use arx_daemon::{routes, state};
use arx_db::store::JobStore;
use arx_testkit::{sample_snapshot, MemConfig, MemJobs, MemStore, ScriptedSource};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestApp {
    router: axum::Router,
    store: Arc<MemStore>,
    jobs: Arc<MemJobs>,
    state: Arc<state::AppState>,
}

/// Build a fresh in-process router backed by clean in-memory stores and a
/// scripted source whose roster holds the given accounts.
fn make_app(roster: Vec<&str>) -> TestApp {
    let store = Arc::new(MemStore::new());
    let jobs = Arc::new(MemJobs::new());
    let config = Arc::new(MemConfig::new());
    let source = Arc::new(ScriptedSource::new(roster).backed_by(Arc::clone(&store)));

    let st = Arc::new(state::AppState::new(
        Arc::clone(&store) as _,
        Arc::clone(&jobs) as _,
        config,
        source,
        2,
    ));
    TestApp {
        router: routes::build_router(Arc::clone(&st)),
        store,
        jobs,
        state: st,
    }
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn json_req(method: &str, uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(
    router: &axum::Router,
    req: Request<axum::body::Body>,
) -> (StatusCode, bytes::Bytes) {
    let resp = router.clone().oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let app = make_app(vec![]);
    let (status, body) = call(&app.router, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "arx-daemon");
}

// ---------------------------------------------------------------------------
// POST /v1/snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accept_snapshot_creates_then_conflicts() {
    let app = make_app(vec![]);
    let payload = serde_json::to_value(sample_snapshot("620547", 2025, 10)).unwrap();

    let (status, body) = call(&app.router, json_req("POST", "/v1/snapshot", payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let json = parse_json(body);
    assert_eq!(json["invoice_number"], "620547-202510");
    assert!(json["archived_at"].is_string());

    // Retried delivery of the same period: 409, original untouched.
    let (status, body) = call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let json = parse_json(body);
    assert_eq!(json["invoice_number"], "620547-202510");
    assert_eq!(app.store.snapshot_count(), 1);
}

#[tokio::test]
async fn accept_snapshot_rejects_malformed_payload() {
    let app = make_app(vec![]);
    let mut snap = sample_snapshot("620547", 2025, 10);
    snap.billing_month = 13;
    let payload = serde_json::to_value(snap).unwrap();

    let (status, _) = call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.snapshot_count(), 0);
}

// ---------------------------------------------------------------------------
// GET /v1/snapshot/:invoice (+ csv)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_snapshot_returns_record_with_line_items() {
    let app = make_app(vec![]);
    let payload = serde_json::to_value(sample_snapshot("620547", 2025, 10)).unwrap();
    call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;

    let (status, body) = call(&app.router, get("/v1/snapshot/620547-202510")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["account_number"], "620547");
    assert_eq!(json["line_items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn get_snapshot_unknown_invoice_is_404() {
    let app = make_app(vec![]);
    let (status, _) = call(&app.router, get("/v1/snapshot/999999-209901")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn csv_download_sets_headers_and_body() {
    let app = make_app(vec![]);
    let payload = serde_json::to_value(sample_snapshot("620547", 2025, 10)).unwrap();
    call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;

    let resp = app
        .router
        .clone()
        .oneshot(get("/v1/snapshot/620547-202510/csv"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/csv");
    assert_eq!(
        resp.headers()["content-disposition"],
        "attachment; filename=\"620547-202510.csv\""
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("item,quantity,rate,amount"));
}

// ---------------------------------------------------------------------------
// GET /v1/snapshots/search + account history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_filters_by_account_and_period() {
    let app = make_app(vec![]);
    for (account, year, month) in [("620547", 2025, 9), ("620547", 2025, 10), ("183729", 2025, 10)]
    {
        let payload = serde_json::to_value(sample_snapshot(account, year, month)).unwrap();
        let (status, _) = call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = call(
        &app.router,
        get("/v1/snapshots/search?account=620547&year=2025"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["total"], 2);

    let (_, body) = call(&app.router, get("/v1/snapshots/search?month=10")).await;
    assert_eq!(parse_json(body)["total"], 2);

    let (_, body) = call(&app.router, get("/v1/snapshots/search?limit=1")).await;
    let json = parse_json(body);
    assert_eq!(json["total"], 3);
    assert_eq!(json["results"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn account_history_is_newest_period_first() {
    let app = make_app(vec![]);
    for month in [9, 10, 8] {
        let payload = serde_json::to_value(sample_snapshot("620547", 2025, month)).unwrap();
        call(&app.router, json_req("POST", "/v1/snapshot", payload)).await;
    }

    let (status, body) = call(&app.router, get("/v1/snapshots/account/620547")).await;
    assert_eq!(status, StatusCode::OK);
    let months: Vec<i64> = parse_json(body)
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["billing_month"].as_i64().unwrap())
        .collect();
    assert_eq!(months, vec![10, 9, 8]);
}

// ---------------------------------------------------------------------------
// Scheduler config
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_config_roundtrip_preserves_last_run_fields() {
    let app = make_app(vec![]);

    let (status, body) = call(&app.router, get("/v1/scheduler/config")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["day_of_month"], 1);
    assert_eq!(json["last_run_status"], "never-run");

    let update = serde_json::json!({
        "enabled": false,
        "day_of_month": 15,
        "hour": 6,
        "snapshot_previous_month": false,
        "snapshot_all_accounts": true,
    });
    let (status, body) = call(&app.router, json_req("PUT", "/v1/scheduler/config", update)).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["enabled"], false);
    assert_eq!(json["day_of_month"], 15);
    assert_eq!(json["last_run_status"], "never-run");
}

#[tokio::test]
async fn scheduler_config_rejects_out_of_range_day() {
    let app = make_app(vec![]);
    let update = serde_json::json!({
        "enabled": true,
        "day_of_month": 32,
        "hour": 2,
        "snapshot_previous_month": true,
        "snapshot_all_accounts": true,
    });
    let (status, _) = call(&app.router, json_req("PUT", "/v1/scheduler/config", update)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// POST /v1/runs + job ledger
// ---------------------------------------------------------------------------

/// Poll the ledger until the job reaches a terminal state.
async fn wait_for_terminal(app: &TestApp, job_id: uuid::Uuid) -> arx_schemas::JobDetail {
    for _ in 0..100 {
        if let Ok(detail) = app.jobs.fetch_job(job_id).await {
            if detail.job.status.is_terminal() {
                return detail;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn trigger_run_processes_roster_and_records_job() {
    let app = make_app(vec!["620547", "183729"]);
    let body = serde_json::json!({"year": 2025, "month": 10});

    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let json = parse_json(resp);
    let job_id: uuid::Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(json["status"], "accepted");

    let detail = wait_for_terminal(&app, job_id).await;
    assert_eq!(detail.job.status, arx_schemas::JobStatus::Completed);
    assert_eq!(detail.job.counts.success, 2);
    assert_eq!(app.store.snapshot_count(), 2);

    // Ledger is visible over HTTP too.
    let (status, body) = call(&app.router, get(&format!("/v1/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["outcomes"].as_array().unwrap().len(), 2);

    let (status, body) = call(&app.router, get("/v1/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body).as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn trigger_run_rejects_partial_period() {
    let app = make_app(vec![]);
    let (status, _) = call(
        &app.router,
        json_req("POST", "/v1/runs", serde_json::json!({"year": 2025})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app.router,
        json_req("POST", "/v1/runs", serde_json::json!({"year": 2025, "month": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_id_is_404() {
    let app = make_app(vec![]);
    let (status, _) = call(
        &app.router,
        get(&format!("/v1/jobs/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dry_run_trigger_writes_no_snapshots() {
    let app = make_app(vec!["620547", "183729"]);
    let body = serde_json::json!({"year": 2025, "month": 10, "dry_run": true});

    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = parse_json(resp)["job_id"].as_str().unwrap().parse().unwrap();

    let detail = wait_for_terminal(&app, job_id).await;
    assert_eq!(detail.job.status, arx_schemas::JobStatus::Completed);
    assert!(detail.job.dry_run);
    assert_eq!(app.store.snapshot_count(), 0);
}

#[tokio::test]
async fn second_trigger_while_a_run_is_in_flight_is_refused() {
    let store = Arc::new(MemStore::new());
    let jobs = Arc::new(MemJobs::new());
    let source = Arc::new(
        ScriptedSource::new(vec!["620547"])
            .backed_by(Arc::clone(&store))
            .with_delay("620547", Duration::from_millis(200)),
    );
    let st = Arc::new(state::AppState::new(
        Arc::clone(&store) as _,
        Arc::clone(&jobs) as _,
        Arc::new(MemConfig::new()),
        source,
        1,
    ));
    let app = TestApp {
        router: routes::build_router(Arc::clone(&st)),
        store,
        jobs,
        state: st,
    };

    let body = serde_json::json!({"year": 2025, "month": 10});
    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = parse_json(resp)["job_id"].as_str().unwrap().parse().unwrap();

    // The first run is still sleeping inside its only account.
    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(parse_json(resp)["error"]
        .as_str()
        .unwrap()
        .contains("in progress"));

    // Once it finishes, a new trigger is accepted again.
    wait_for_terminal(&app, job_id).await;
    let body2 = serde_json::json!({"year": 2025, "month": 11});
    let (status, _) = call(&app.router, json_req("POST", "/v1/runs", body2)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn shutdown_cancel_finalizes_inflight_run_with_aborted_outcomes() {
    let store = Arc::new(MemStore::new());
    let jobs = Arc::new(MemJobs::new());
    let source = Arc::new(
        ScriptedSource::new(vec!["620547", "183729"])
            .backed_by(Arc::clone(&store))
            .with_delay("620547", Duration::from_millis(150)),
    );
    let st = Arc::new(state::AppState::new(
        Arc::clone(&store) as _,
        Arc::clone(&jobs) as _,
        Arc::new(MemConfig::new()),
        source,
        1,
    ));
    let app = TestApp {
        router: routes::build_router(Arc::clone(&st)),
        store,
        jobs,
        state: st,
    };

    let body = serde_json::json!({"year": 2025, "month": 10});
    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = parse_json(resp)["job_id"].as_str().unwrap().parse().unwrap();

    // Cancel while the first account is still sleeping; the run must still
    // reach a terminal status with the unprocessed account recorded.
    tokio::time::sleep(Duration::from_millis(50)).await;
    app.state.shutdown.cancel();

    let detail = wait_for_terminal(&app, job_id).await;
    assert_eq!(
        detail.job.status,
        arx_schemas::JobStatus::CompletedWithErrors
    );
    assert_eq!(detail.job.counts.total, 2);
    assert_eq!(detail.job.counts.completed, 2);
    assert_eq!(detail.job.counts.success, 1);
    assert_eq!(detail.job.counts.failed, 1);
    assert_eq!(detail.outcomes[0].kind, arx_schemas::OutcomeKind::Archived);
    assert_eq!(detail.outcomes[1].kind, arx_schemas::OutcomeKind::Aborted);
    assert_eq!(app.store.snapshot_count(), 1);
}

#[tokio::test]
async fn explicit_account_scope_limits_the_run() {
    let app = make_app(vec!["620547", "183729", "777777"]);
    let body = serde_json::json!({
        "year": 2025, "month": 10, "accounts": ["183729"]
    });

    let (status, resp) = call(&app.router, json_req("POST", "/v1/runs", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id: uuid::Uuid = parse_json(resp)["job_id"].as_str().unwrap().parse().unwrap();

    let detail = wait_for_terminal(&app, job_id).await;
    assert_eq!(detail.job.counts.total, 1);
    assert_eq!(detail.outcomes[0].account_number, "183729");
    assert_eq!(app.store.snapshot_count(), 1);
}
