//! Operator CLI for the billing snapshot archive.
//!
//! Talks to the same Postgres instance and source services as arx-daemon;
//! runs triggered here execute in-process rather than through the HTTP
//! surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use arx_db::store::{ConfigStore, JobStore, PgStore, SnapshotFilter, SnapshotStore};
use arx_orchestrator::{run_batch, RunDeps, RunRequest, DEFAULT_RUN_CONCURRENCY};
use arx_schemas::{RunScope, SchedulerConfigUpdate, TargetPeriod};
use arx_source::RestSourceAdapter;

#[derive(Parser)]
#[command(name = "arx")]
#[command(about = "Billing snapshot archive CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Execute a snapshot run in-process and wait for it to finish.
    Run {
        /// Billing year to archive
        #[arg(long)]
        year: i32,

        /// Billing month to archive (1-12)
        #[arg(long)]
        month: i32,

        /// Restrict the run to these account numbers (default: full roster)
        #[arg(long = "account")]
        accounts: Vec<String>,

        /// Record would-process outcomes without writing anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// In-flight account attempts
        #[arg(long, default_value_t = DEFAULT_RUN_CONCURRENCY)]
        concurrency: usize,

        /// Acknowledge triggering while another job is pending/running.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /// Scheduler policy commands
    Scheduler {
        #[command(subcommand)]
        cmd: SchedulerCmd,
    },

    /// Job ledger commands
    Jobs {
        #[command(subcommand)]
        cmd: JobsCmd,
    },

    /// Stored snapshot commands
    Snapshot {
        #[command(subcommand)]
        cmd: SnapshotCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations. Guardrail: refuses while any job is
    /// pending/running unless --yes is provided.
    Migrate {
        /// Acknowledge migrating a DB with jobs in flight.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum SchedulerCmd {
    /// Print the current policy and last-run fields.
    Show,

    /// Replace the policy fields.
    Set {
        #[arg(long)]
        enabled: bool,

        /// Day of month the run fires on (1-31)
        #[arg(long)]
        day: i32,

        /// Hour of day, UTC (0-23)
        #[arg(long)]
        hour: i32,

        /// Archive the month before the trigger time
        #[arg(long, default_value_t = true)]
        previous_month: bool,

        /// Resolve the full roster at run start
        #[arg(long, default_value_t = true)]
        all_accounts: bool,
    },
}

#[derive(Subcommand)]
enum JobsCmd {
    /// List recent jobs, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Print one job with its per-account outcomes.
    Show {
        #[arg(long)]
        job_id: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCmd {
    /// Print one stored snapshot (without the CSV body).
    Get {
        #[arg(long)]
        invoice: String,
    },

    /// Write the stored invoice CSV to a file.
    ExportCsv {
        #[arg(long)]
        invoice: String,

        /// Output path (default: <invoice>.csv in the working directory)
        #[arg(long)]
        out: Option<String>,
    },

    /// Search the archive.
    Search {
        #[arg(long)]
        account: Option<String>,

        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        month: Option<i32>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = arx_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = arx_db::status(&pool).await?;
                    println!("db_ok={} has_snapshots_table={}", s.ok, s.has_snapshots_table);
                }
                DbCmd::Migrate { yes } => {
                    let n = arx_db::count_active_jobs(&pool).await?;
                    if n > 0 && !yes {
                        anyhow::bail!(
                            "REFUSING MIGRATE: detected {} job(s) in pending/running. Re-run with: `arx db migrate --yes`",
                            n
                        );
                    }

                    arx_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Run {
            year,
            month,
            accounts,
            dry_run,
            concurrency,
            yes,
        } => {
            let period = TargetPeriod { year, month };
            if !period.is_valid() {
                anyhow::bail!("invalid target period {}-{:02}", year, month);
            }

            let pool = arx_db::connect_from_env().await?;

            // Same guardrail shape as `arx db migrate`: a run already in
            // flight (daemon-driven or another CLI) must not be raced.
            let active = arx_db::count_active_jobs(&pool).await?;
            if active > 0 && !yes {
                anyhow::bail!(
                    "REFUSING RUN: detected {} job(s) in pending/running. Re-run with: `arx run --yes ...`",
                    active
                );
            }
            let store = Arc::new(PgStore::new(pool));
            let source =
                Arc::new(RestSourceAdapter::from_env().context("source adapter config")?);

            let deps = RunDeps {
                jobs: Arc::clone(&store) as _,
                config: store,
                source,
            };

            let scope = if accounts.is_empty() {
                RunScope::AllAccounts
            } else {
                RunScope::Accounts(accounts)
            };

            let mut req = RunRequest::manual(period, scope, "cli");
            req.dry_run = dry_run;
            req.concurrency = concurrency;

            let report = run_batch(&deps, req).await?;
            println!("job_id={}", report.job_id);
            println!("status={}", report.status.as_str());
            println!(
                "total={} completed={} success={} failed={}",
                report.counts.total,
                report.counts.completed,
                report.counts.success,
                report.counts.failed
            );
            for o in &report.outcomes {
                println!(
                    "account={} outcome={} detail={}",
                    o.account_number,
                    o.kind.as_str(),
                    o.detail.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Scheduler { cmd } => {
            let pool = arx_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            match cmd {
                SchedulerCmd::Show => {
                    let cfg = store.load().await?;
                    print_config(&cfg);
                }
                SchedulerCmd::Set {
                    enabled,
                    day,
                    hour,
                    previous_month,
                    all_accounts,
                } => {
                    let cfg = store
                        .replace(SchedulerConfigUpdate {
                            enabled,
                            day_of_month: day,
                            hour,
                            snapshot_previous_month: previous_month,
                            snapshot_all_accounts: all_accounts,
                        })
                        .await?;
                    println!("updated=true");
                    print_config(&cfg);
                }
            }
        }

        Commands::Jobs { cmd } => {
            let pool = arx_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            match cmd {
                JobsCmd::List { limit } => {
                    for j in store.list_jobs(limit, 0).await? {
                        println!(
                            "job_id={} type={} status={} period={}-{:02} total={} success={} failed={} started_at={}",
                            j.job_id,
                            j.job_type.as_str(),
                            j.status.as_str(),
                            j.target_year,
                            j.target_month,
                            j.counts.total,
                            j.counts.success,
                            j.counts.failed,
                            j.started_at.to_rfc3339()
                        );
                    }
                }
                JobsCmd::Show { job_id } => {
                    let id = Uuid::parse_str(&job_id).context("invalid job_id uuid")?;
                    let detail = store.fetch_job(id).await?;
                    println!("job_id={}", detail.job.job_id);
                    println!("type={}", detail.job.job_type.as_str());
                    println!("status={}", detail.job.status.as_str());
                    println!(
                        "period={}-{:02}",
                        detail.job.target_year, detail.job.target_month
                    );
                    println!("dry_run={}", detail.job.dry_run);
                    println!(
                        "total={} completed={} success={} failed={}",
                        detail.job.counts.total,
                        detail.job.counts.completed,
                        detail.job.counts.success,
                        detail.job.counts.failed
                    );
                    println!("error={}", detail.job.error.as_deref().unwrap_or("-"));
                    println!("triggered_by={}", detail.job.triggered_by);
                    for o in &detail.outcomes {
                        println!(
                            "account={} outcome={} detail={}",
                            o.account_number,
                            o.kind.as_str(),
                            o.detail.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }

        Commands::Snapshot { cmd } => {
            let pool = arx_db::connect_from_env().await?;
            let store = PgStore::new(pool);
            match cmd {
                SnapshotCmd::Get { invoice } => {
                    let snap = store.get(&invoice).await?;
                    println!("invoice_number={}", snap.snapshot.invoice_number);
                    println!("account_number={}", snap.snapshot.account_number);
                    println!("company_name={}", snap.snapshot.company_name);
                    println!(
                        "period={}-{:02}",
                        snap.snapshot.billing_year, snap.snapshot.billing_month
                    );
                    println!("total_amount={:.2}", snap.snapshot.total_amount);
                    println!("archived_at={}", snap.snapshot.archived_at.to_rfc3339());
                    println!("created_by={}", snap.snapshot.created_by);
                    println!("line_items={}", snap.line_items.len());
                }
                SnapshotCmd::ExportCsv { invoice, out } => {
                    let snap = store.get(&invoice).await?;
                    let path = out.unwrap_or_else(|| format!("{invoice}.csv"));
                    std::fs::write(&path, snap.snapshot.invoice_csv.as_bytes())
                        .with_context(|| format!("write csv: {path}"))?;
                    println!("exported=true path={path}");
                }
                SnapshotCmd::Search {
                    account,
                    year,
                    month,
                    limit,
                } => {
                    let page = store
                        .search(SnapshotFilter {
                            account,
                            year,
                            month,
                            limit,
                            offset: 0,
                        })
                        .await?;
                    println!("total={}", page.total);
                    for s in &page.results {
                        println!(
                            "invoice={} account={} period={}-{:02} total_amount={:.2} archived_at={}",
                            s.invoice_number,
                            s.account_number,
                            s.billing_year,
                            s.billing_month,
                            s.total_amount,
                            s.archived_at.to_rfc3339()
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

// Quieter default than the daemon; `RUST_LOG=info` surfaces run progress.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}

fn print_config(cfg: &arx_schemas::SchedulerConfig) {
    println!("enabled={}", cfg.enabled);
    println!("day_of_month={}", cfg.day_of_month);
    println!("hour={}", cfg.hour);
    println!("snapshot_previous_month={}", cfg.snapshot_previous_month);
    println!("snapshot_all_accounts={}", cfg.snapshot_all_accounts);
    println!(
        "last_run_at={}",
        cfg.last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("last_run_status={}", cfg.last_run_status.as_str());
    println!("last_run_count={}", cfg.last_run_count);
}
