use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hfx_core::RunType;
use hfx_pipeline::{maybe_build_scheduler, Pipeline, PipelineConfig, SchedulerConfig};
use hfx_registry::{RegistryClient, RegistryConfig};
use hfx_storage::PgStore;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hfx")]
#[command(about = "HygieneFix ratings service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion pipeline once and print the run statistics.
    Sync {
        /// Fetch establishments rated at or below this tier.
        #[arg(long, default_value_t = 2)]
        max_rating: u8,
        /// Fetch and count only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API.
    Serve,
    /// Run the cron scheduler in the foreground until interrupted.
    Schedule,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

async fn connect_store() -> Result<PgStore> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    PgStore::connect(&database_url)
        .await
        .context("connecting to database")
}

fn registry_client() -> Result<RegistryClient> {
    RegistryClient::new(RegistryConfig::from_env())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        max_rating: 2,
        dry_run: false,
    }) {
        Commands::Sync {
            max_rating,
            dry_run,
        } => {
            let store = Arc::new(connect_store().await?);
            let registry = Arc::new(registry_client()?);
            let config = PipelineConfig {
                max_rating,
                dry_run,
                ..PipelineConfig::from_env()
            };
            let stats = Pipeline::new(config, registry, store)
                .run(RunType::Manual)
                .await;
            println!(
                "sync complete: fetched={} new={} changes={} errors={}",
                stats.total_fetched, stats.new_establishments, stats.rating_changes, stats.errors
            );
            for line in &stats.error_log {
                eprintln!("  {line}");
            }
        }
        Commands::Migrate => {
            let store = connect_store().await?;
            store.run_migrations().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => hfx_web::serve_from_env().await?,
        Commands::Schedule => {
            let store = Arc::new(connect_store().await?);
            let registry = Arc::new(registry_client()?);
            let pipeline = Arc::new(Pipeline::new(PipelineConfig::from_env(), registry, store));

            let config = SchedulerConfig {
                enabled: true,
                ..SchedulerConfig::from_env()
            };
            if let Some(mut sched) = maybe_build_scheduler(pipeline, &config).await? {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.cron, "scheduler running");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for shutdown signal")?;
            }
        }
    }

    Ok(())
}
