//! `scanwarden` CLI — the entire external control surface of the
//! scan-scheduling engine: `scanwarden run` (single-shot
//! dispatch) and `scanwarden status` (lease/governor/log report).
//!
//! Load config from the environment, initialize structured logging once,
//! bootstrap the store and every subsystem, then drive one invocation to
//! completion. This binary never opens a listening port — the Dispatcher
//! itself is the whole program.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use scanwarden_core::config::SchedulerConfig;
use scanwarden_core::dispatcher::{Dispatcher, ProbePlanResolver, TargetProbePlan};
use scanwarden_core::escalation::EscalationEngine;
use scanwarden_core::governor::{GovernorLevel, ResourceGovernor};
use scanwarden_core::lease::LeaseLock;
use scanwarden_core::notify::{EmailChannel, NotificationJobHandler, NotificationOrchestrator, SmsChannel, WebhookChannel};
use scanwarden_core::probe::{Executor, ProbeRegistry, ReachabilityProbe};
use scanwarden_core::queue::QueueRunner;
use scanwarden_store::models::Target;
use scanwarden_store::Store;

/// `scanwarden` — distributed scan-scheduling and execution engine.
#[derive(Parser)]
#[command(
    name = "scanwarden",
    version,
    about = "scanwarden — distributed scan-scheduling and execution engine",
    long_about = None,
    after_help = "Environment variables:\n  \
         DATABASE_URL    PostgreSQL connection string (ignored with --storage memory)\n  \
         SCANWARDEN_*    Any tunable documented in the scheduler configuration\n\n\
         Examples:\n  \
         scanwarden run\n  \
         scanwarden status --log-lines 20",
)]
struct Cli {
    /// Storage backend: `postgres` (default, via `DATABASE_URL`) or `memory`
    /// (development/dry-run, data is not persisted).
    #[arg(long, default_value = "postgres")]
    storage: StorageArg,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Disable colored/banner startup output.
    #[arg(long, default_value_t = false)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum StorageArg {
    Postgres,
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one dispatcher invocation: acquire the lease, dispatch due
    /// targets, run maintenance and the retry sweep, then exit.
    Run,
    /// Report lease info, governor status, and the last N scheduler log
    /// entries.
    Status {
        /// Number of recent `scheduler_log` entries to display.
        #[arg(long, default_value_t = 20)]
        log_lines: i64,
    },
}

const BANNER: &str = r"
  ___________      _____      _______  __
 / __/ ___/ _ |    / __ | ___ / ___/ |/ /
 _\ \/ /__/ __ |  / __ |/ _ `/ /  /    /
/___/\___/_/ |_| /_/ |_|\_,_/_/  /_/|_/
";

fn print_banner(no_color: bool) {
    if no_color {
        eprintln!("scanwarden — distributed scan-scheduling and execution engine");
    } else {
        eprintln!("\x1b[36m\x1b[1m{BANNER}\x1b[0m");
        eprintln!("  \x1b[2mDistributed scan-scheduling and execution engine\x1b[0m");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    print_banner(cli.no_color);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "scanwarden exited with a fatal error");
            ExitCode::from(4)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = SchedulerConfig::from_env();
    let store = build_store(&cli, &config).await?;

    match cli.command {
        Commands::Run => run_dispatch(store, config).await,
        Commands::Status { log_lines } => run_status(store, config, log_lines).await,
    }
}

async fn build_store(cli: &Cli, _config: &SchedulerConfig) -> anyhow::Result<Arc<dyn Store>> {
    match cli.storage {
        StorageArg::Memory => {
            info!("using in-memory storage (data will not persist)");
            Ok(Arc::new(scanwarden_store::memory::MemoryStore::new()))
        }
        #[cfg(feature = "postgres-backend")]
        StorageArg::Postgres => {
            let url = cli
                .database_url
                .clone()
                .context("--database-url or DATABASE_URL is required for --storage postgres")?;
            info!("using PostgreSQL storage");
            let store = scanwarden_store::postgres::PgStore::connect(&url, 10)
                .await
                .context("failed to connect to PostgreSQL")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageArg::Postgres => {
            anyhow::bail!("PostgreSQL backend requested but feature 'postgres-backend' is not enabled");
        }
    }
}

/// Resolves every target to the single illustrative `reachability` probe.
/// A real deployment injects the `website_test_config` join; this is the dependency-free default for `scanwarden
/// run` against a freshly-provisioned store.
struct ReachabilityOnlyPlan;

#[async_trait]
impl ProbePlanResolver for ReachabilityOnlyPlan {
    async fn resolve(&self, _target: &Target) -> Vec<TargetProbePlan> {
        vec![TargetProbePlan {
            probe_name: "reachability".to_owned(),
            config: scanwarden_core::probe::ProbeConfig::new(),
            options: scanwarden_core::probe::RunOptions::default(),
        }]
    }
}

/// Registers whichever notification channels have credentials present in
/// the environment. `webhook` needs none and is always available; `email`
/// and `sms` activate only when their provider's credentials are set, the
/// same "configure what's present" shape `build_store` uses for storage.
async fn register_notification_channels(orchestrator: &NotificationOrchestrator) {
    orchestrator.register(Arc::new(WebhookChannel::new())).await;

    if let (Ok(relay_url), Ok(api_key)) =
        (std::env::var("SCANWARDEN_EMAIL_RELAY_URL"), std::env::var("SCANWARDEN_EMAIL_API_KEY"))
    {
        orchestrator.register(Arc::new(EmailChannel::new(relay_url, api_key))).await;
    }

    if let (Ok(account_sid), Ok(auth_token), Ok(from_number)) = (
        std::env::var("SCANWARDEN_SMS_ACCOUNT_SID"),
        std::env::var("SCANWARDEN_SMS_AUTH_TOKEN"),
        std::env::var("SCANWARDEN_SMS_FROM_NUMBER"),
    ) {
        orchestrator.register(Arc::new(SmsChannel::new(account_sid, auth_token, from_number))).await;
    }
}

async fn run_dispatch(store: Arc<dyn Store>, config: SchedulerConfig) -> anyhow::Result<ExitCode> {
    let governor = Arc::new(ResourceGovernor::new(Arc::clone(&store), config.clone()));

    let registry = Arc::new(ProbeRegistry::new());
    registry.register(Arc::new(ReachabilityProbe::new())).await;
    let executor = Arc::new(Executor::new(registry));

    let queue = Arc::new(QueueRunner::new(Arc::clone(&store), config.clone()));
    let escalation = Arc::new(EscalationEngine::new(Arc::clone(&store), Arc::clone(&queue), config.clone()));

    let orchestrator = Arc::new(NotificationOrchestrator::new(Arc::clone(&store), config.clone()));
    register_notification_channels(&orchestrator).await;
    let job_handler = Arc::new(NotificationJobHandler::new(Arc::clone(&store), Arc::clone(&orchestrator)));

    let (worker_tx, worker_rx) = watch::channel(false);
    let workers = tokio::spawn(Arc::clone(&queue).run_workers(Arc::clone(&job_handler), worker_rx));

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        governor,
        executor,
        Arc::new(ReachabilityOnlyPlan),
        escalation,
        config,
    );

    let (_tx, mut shutdown_rx) = watch::channel(false);
    let outcome = dispatcher.run(&mut shutdown_rx).await;

    info!(
        success = outcome.success,
        targets_processed = outcome.targets_processed,
        message = %outcome.message,
        "dispatcher run finished"
    );
    println!("{}", outcome.message);
    if let Some(lock_info) = &outcome.lock_info {
        println!("lease held by: {}", lock_info.owner);
    }

    // Give the job workers a final drain pass over whatever the run just
    // enqueued (escalation/governor-alert jobs), then signal them to stop.
    let _ = queue.run_once("cli-drain", job_handler.as_ref(), 100).await;
    let _ = worker_tx.send(true);
    let _ = workers.await;

    Ok(ExitCode::from(outcome.exit_code()))
}

async fn run_status(store: Arc<dyn Store>, config: SchedulerConfig, log_lines: i64) -> anyhow::Result<ExitCode> {
    let lease = LeaseLock::new(Arc::clone(&store));
    let lock_info = lease.info("scheduler_execution").await?;
    let now = store.now().await?;

    println!("=== scheduler_execution lease ===");
    match &lock_info {
        Some(info) if info.is_held(now) => {
            println!("held by: {}", info.owner);
            println!("expires at: {}", info.expires_at);
        }
        Some(info) => println!("expired (last owner: {})", info.owner),
        None => println!("not held"),
    }

    let governor = ResourceGovernor::new(Arc::clone(&store), config);
    let status = governor.sample().await?;
    println!("\n=== resource governor ===");
    println!("overall: {:?}", status.overall);
    for rec in &status.recommendations {
        println!("  - {rec}");
    }

    println!("\n=== last {log_lines} scheduler_log entries ===");
    let logs = store.recent_logs(log_lines).await?;
    for entry in &logs {
        println!("[{}] {} {}", entry.created_at, entry.level, entry.message);
    }

    let exit = if status.overall >= GovernorLevel::Throttle { 2 } else { 0 };
    Ok(ExitCode::from(exit))
}
