use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use revlens_analytics::compute_report;
use revlens_core::{parse_days, parse_platform, ReviewFilters};
use revlens_storage::{InMemoryReviewStore, PgReviewStore, ReviewStore};
use revlens_sync::{maybe_build_scheduler, ReviewPipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revlens-cli")]
#[command(about = "Review aggregation and analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Keep reviews in process memory instead of Postgres.
    #[arg(long)]
    memory: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Aggregate and store reviews for one business, or for the watchlist.
    Sync {
        #[arg(long)]
        business: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print the analytics report for the stored corpus.
    Analytics {
        #[arg(long)]
        business: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        days: Option<String>,
        #[command(flatten)]
        store: StoreArgs,
    },
    Serve {
        #[command(flatten)]
        store: StoreArgs,
    },
    Migrate,
    /// Run the watchlist on the configured cron schedule until interrupted.
    Schedule {
        #[command(flatten)]
        store: StoreArgs,
    },
}

async fn open_store(config: &SyncConfig, args: &StoreArgs) -> Result<Arc<dyn ReviewStore>> {
    if args.memory {
        return Ok(Arc::new(InMemoryReviewStore::new()));
    }
    let store = PgReviewStore::connect(&config.database_url)
        .await
        .context("connecting to review store")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("revlens=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync {
            business,
            location,
            store,
        } => {
            let store = open_store(&config, &store).await?;
            let pipeline = ReviewPipeline::from_config(&config, store).await?;
            let runs = match business {
                Some(name) => vec![pipeline.run_for_business(&name, location.as_deref()).await],
                None => pipeline.run_watchlist().await,
            };
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Commands::Analytics {
            business,
            platform,
            days,
            store,
        } => {
            let days = parse_days(days.as_deref())?;
            let platform = parse_platform(platform.as_deref())?;
            let store = open_store(&config, &store).await?;
            let now = Utc::now();
            let filters = ReviewFilters::trailing_window(business, platform, days, now);
            let slice = store.query_by_filters(&filters, None).await?;
            let report = compute_report(&slice, days, now);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve { store } if !store.memory => revlens_web::serve_from_env().await?,
        Commands::Serve { store } => {
            let store = open_store(&config, &store).await?;
            let pipeline = Arc::new(ReviewPipeline::from_config(&config, store.clone()).await?);
            revlens_web::serve(revlens_web::AppState::new(store, pipeline), config.web_port).await?;
        }
        Commands::Migrate => {
            let store = PgReviewStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Schedule { store } => {
            let mut config = config;
            config.scheduler_enabled = true;
            let store = open_store(&config, &store).await?;
            let pipeline = Arc::new(ReviewPipeline::from_config(&config, store).await?);
            let Some(sched) = maybe_build_scheduler(&config, pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}
