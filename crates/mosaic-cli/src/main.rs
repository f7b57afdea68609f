use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mosaic_storage::{run_migrations, PgRepositoryStore};
use mosaic_sync::SyncConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mosaic-cli")]
#[command(about = "Mosaic repository catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one catalog sync and exit.
    Sync,
    /// Apply pending database migrations.
    Migrate,
    /// Serve the catalog over HTTP, with the cron scheduler when enabled.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = match mosaic_sync::run_sync_once_from_env().await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(error = %err, "sync failed");
                    return Err(err);
                }
            };
            println!(
                "sync complete: run_id={} candidates={} resolved={} inserted={} updated={} \
                 deleted={} failures={}",
                summary.run_id,
                summary.candidates,
                summary.resolved,
                summary.reconcile.inserted,
                summary.reconcile.updated,
                summary.reconcile.deleted,
                summary.reconcile.failures.len()
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgRepositoryStore::connect(&config.database_url)
                .await
                .context("connecting to repository store")?;
            run_migrations(store.pool()).await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            let pipeline = Arc::new(mosaic_sync::build_pipeline_from_env(&config).await?);
            let mut scheduler =
                mosaic_sync::maybe_build_scheduler(&config, pipeline.clone()).await?;
            if let Some(sched) = scheduler.as_ref() {
                sched.start().await.context("starting scheduler")?;
            }

            let served = mosaic_web::serve_from_config(&config, pipeline).await;

            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            served?;
        }
    }

    Ok(())
}
