//! arx-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, connects storage,
//! builds the shared state, wires middleware, and starts the HTTP server.
//! All route handlers live in `routes.rs`; all shared state types live in
//! `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use arx_daemon::{routes, state};
use arx_db::store::PgStore;
use arx_source::RestSourceAdapter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let pool = arx_db::connect_from_env()
        .await
        .context("database connection failed")?;
    arx_db::migrate(&pool).await.context("migration failed")?;

    // A previous process that died mid-run leaves its job pending/running;
    // no run may stay non-terminal once the process driving it is gone.
    let swept = arx_db::jobs::fail_orphaned(&pool, "daemon restarted while run was in flight")
        .await
        .context("orphaned-job sweep failed")?;
    if swept > 0 {
        warn!(swept, "finalized orphaned jobs as failed at startup");
    }

    let store = Arc::new(PgStore::new(pool));
    let source = Arc::new(RestSourceAdapter::from_env().context("source adapter config")?);

    let shared = Arc::new(state::AppState::new(
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
        store,
        source,
        state::run_concurrency_from_env(),
    ));

    state::spawn_scheduler_tick(Arc::clone(&shared), Duration::from_secs(60));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8860)));
    info!("arx-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal(shared))
        .await
        .context("server crashed")?;

    Ok(())
}

/// Wait for SIGINT, then cancel the in-flight run (if any) and block until
/// it has finalized its job row before letting the server exit.
async fn shutdown_signal(shared: Arc<state::AppState>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received; cancelling in-flight run");
    shared.shutdown.cancel();

    // The guard is held for the whole of a run; acquiring it means the run
    // has recorded its aborted outcomes and reached a terminal status.
    let _ = shared.run_guard.lock().await;
    info!("no run in flight; shutting down");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(state::ENV_DAEMON_ADDR).ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(tower_http::cors::Any)
}
