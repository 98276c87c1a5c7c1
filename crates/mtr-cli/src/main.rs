use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mtr-cli")]
#[command(about = "Medical Tender Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass now.
    Sync {
        /// Lookback window in days; defaults to the configured value.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Serve the JSON API together with the periodic sync loop.
    Serve,
    /// Resolve the line items of an already persisted tender.
    Resolve { tender_id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { days: None }) {
        Commands::Sync { days } => {
            let summary = mtr_pipeline::run_sync_once_from_env(days, true).await?;
            println!(
                "sync complete: run_id={} collected={} new={} enriched={} errors={}",
                summary.run_id,
                summary.collected,
                summary.new_opportunities,
                summary.enriched,
                summary.source_errors + summary.enrichment_errors
            );
        }
        Commands::Serve => serve().await?,
        Commands::Resolve { tender_id } => {
            let pipeline = mtr_pipeline::SyncPipeline::from_env().await?;
            match pipeline.resolve_items(&tender_id).await? {
                Some(items) => {
                    println!("{} line items for {tender_id}", items.len());
                    for item in items {
                        println!(
                            "  #{} {} x{} {} @ {:.2}",
                            item.item_number, item.description, item.quantity, item.unit, item.unit_price
                        );
                    }
                }
                None => eprintln!("unknown tender {tender_id}"),
            }
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let pipeline = mtr_pipeline::SyncPipeline::from_env().await?;

    let mut scheduler = mtr_pipeline::maybe_build_scheduler(pipeline.clone()).await?;
    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.start().await.context("starting cron scheduler")?;
        info!("cron scheduler started");
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let periodic = tokio::spawn(pipeline.clone().run_periodic(stop_rx));

    mtr_web::serve(pipeline, shutdown_signal()).await?;

    // Let the in-flight pass finish cleanly before exiting.
    let _ = stop_tx.send(true);
    periodic.await.context("joining periodic sync task")??;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
