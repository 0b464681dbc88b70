use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdrsync_core::RunStatus;
use cdrsync_storage::PgStore;
use cdrsync_sync::{
    database_config_from_env, maybe_build_scheduler, report_recent_runs_markdown,
    run_sync_once_from_env, SyncConfig, SyncPipeline,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cdrsync")]
#[command(about = "CDR ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print the run summary as JSON.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run ingestion on CDR_SYNC_CRON until interrupted.
    Schedule,
    /// Print the most recent script_logs rows as markdown.
    Report {
        #[arg(long, default_value_t = 10)]
        runs: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CDRSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
            if summary.status == RunStatus::Failed {
                std::process::exit(2);
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect_lazy(&database_config_from_env()?)?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
                bail!("scheduler disabled; set CDRSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let store = PgStore::connect_lazy(&database_config_from_env()?)?;
            let entries = store
                .recent_runs(runs)
                .await
                .context("loading script_logs")?;
            println!("{}", report_recent_runs_markdown(&entries));
        }
    }

    Ok(())
}
