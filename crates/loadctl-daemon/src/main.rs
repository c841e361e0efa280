use std::sync::Arc;

use clap::Parser;
use loadctl_core::LoadctlConfig;
use loadctl_scheduler::{Loader, ScheduleDefaults, Scheduler, StopReason};
use tracing::{info, warn};

mod command;

use command::CommandLoader;

/// Runs the configured load jobs on their schedules until stopped.
#[derive(Debug, Parser)]
#[command(name = "loadctl", version, about)]
struct Cli {
    /// Config file (falls back to LOADCTL_CONFIG, then ~/.loadctl/loadctl.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadctl_daemon=info,loadctl_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > LOADCTL_CONFIG env > ~/.loadctl/loadctl.toml
    let config_path = cli.config.or_else(|| std::env::var("LOADCTL_CONFIG").ok());
    let config = LoadctlConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        LoadctlConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let conn = loadctl_scheduler::shared(db)?;
    info!("database schema ready");

    let scheduler = build_scheduler(conn, &config)?;
    scheduler.start()?;

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            scheduler.stop(StopReason::requested("signal"));
        }
        _ = scheduler.wait_stopped() => {}
    }

    let reason = scheduler.wait_stopped().await;
    if reason.fatal {
        anyhow::bail!("scheduler stopped: {reason}");
    }
    info!(%reason, "loadctl exiting");
    Ok(())
}

/// Register one command loader per `[[jobs]]` entry.
///
/// Per-job `cron`, `adjustment` and `max_instances` only seed a missing
/// schedule row; once the row exists the registry values win.
fn build_scheduler(
    conn: loadctl_scheduler::SharedConnection,
    config: &LoadctlConfig,
) -> anyhow::Result<Scheduler> {
    let mut builder = Scheduler::builder_from(conn, config);
    let base = builder.default_schedule();

    for job in &config.jobs {
        let defaults = ScheduleDefaults {
            cron: job.cron.clone().unwrap_or_else(|| base.cron.clone()),
            adjustment: job.adjustment.unwrap_or(base.adjustment),
            max_instances: job.max_instances.unwrap_or(base.max_instances),
            active: base.active,
        };
        let loader: Arc<dyn Loader> = Arc::new(CommandLoader::from_config(job, &config.retry));
        info!(job = %job.name, exclusive = job.exclusive, "registering command job");
        builder = builder.register_with(loader, defaults);
    }

    if config.jobs.is_empty() {
        warn!("no [[jobs]] configured; the scheduler will sit idle");
    }
    Ok(builder.build()?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
