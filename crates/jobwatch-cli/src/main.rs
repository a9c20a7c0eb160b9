use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobwatch_sync::{
    analyze_batch, maybe_build_scheduler, run_sync_once_from_env, RefreshWorker, Services,
    SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Job ingestion, freshness tracking and market analysis")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the provider matrix once and replace the batch.
    Sync,
    /// Drain pending refresh requests into the search cache.
    Refresh {
        #[arg(long, default_value_t = RefreshWorker::DEFAULT_BATCH)]
        limit: usize,
    },
    /// Enrich the current batch with salary market analysis.
    Analyze,
    /// List stale search keys and queue them for refresh.
    Stale {
        /// Roles to check; defaults to every watchlist synonym.
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
        /// Locations to check; defaults to every region.
        #[arg(long, value_delimiter = ',')]
        locations: Vec<String>,
        #[arg(long, default_value = "cli")]
        requester: String,
    },
    Migrate,
    Serve,
    /// Serve the API and run the cron jobs.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} cells={} fetched={} total={} new={} failed_fetches={} batch={}",
                summary.run_id,
                summary.cells,
                summary.fetched,
                summary.total,
                summary.new_jobs,
                summary.failed_fetches,
                summary.batch_path
            );
        }
        Commands::Refresh { limit } => {
            let watchlists = config.load_watchlists()?;
            let services = Services::from_config(config).await?;
            let summary = services
                .refresh_worker(&watchlists.regions)
                .drain(limit)
                .await?;
            println!(
                "refresh complete: processed={} completed={} failed={}",
                summary.processed, summary.completed, summary.failed
            );
        }
        Commands::Analyze => {
            let services = Services::from_config(config).await?;
            if services.providers.market.is_none() {
                warn!("no market sample source configured; jobs will pass through unanalyzed");
            }
            let engine = services.market_engine();
            let summary = analyze_batch(&services.batches, &engine, Utc::now()).await?;
            println!(
                "analyze complete: total={} analyzed={} enriched={}",
                summary.total, summary.analyzed, summary.enriched_path
            );
        }
        Commands::Stale {
            roles,
            locations,
            requester,
        } => {
            let (roles, locations) = if roles.is_empty() || locations.is_empty() {
                let watchlists = config.load_watchlists()?;
                let default_locations = watchlists.regions.iter().map(|r| r.where_.clone()).collect();
                (
                    if roles.is_empty() { watchlists.roles() } else { roles },
                    if locations.is_empty() { default_locations } else { locations },
                )
            } else {
                (roles, locations)
            };
            let services = Services::from_config(config).await?;
            let stale = services
                .feed()
                .queue_stale(&roles, &locations, &requester, Utc::now())
                .await
                .context("queueing stale searches")?;
            for key in &stale {
                println!("{key}");
            }
            println!("stale: {} of {} searches queued", stale.len(), roles.len() * locations.len());
        }
        Commands::Migrate => {
            Services::from_config(config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let services = Services::from_config(config).await?;
            jobwatch_web::serve(&services).await?;
        }
        Commands::Schedule => {
            let services = Services::from_config(SyncConfig {
                scheduler_enabled: true,
                ..config
            })
            .await?;
            let sched = maybe_build_scheduler(&services)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(
                sync_cron = %services.config.sync_cron,
                refresh_cron = %services.config.refresh_cron,
                "scheduler started"
            );
            tokio::select! {
                res = jobwatch_web::serve(&services) => res?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
    }

    Ok(())
}
