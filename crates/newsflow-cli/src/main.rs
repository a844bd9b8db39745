use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use newsflow_sync::{
    build_pipeline, init_schema, maybe_build_scheduler, run_once_with_config, PipelineConfig,
    PipelineFile,
};
use tracing_subscriber::EnvFilter;

const SCHEDULER_DISABLED: &str =
    "scheduling is disabled; set NEWSFLOW_SCHEDULER_ENABLED=true to use `schedule`";

#[derive(Debug, Parser)]
#[command(name = "newsflow")]
#[command(about = "News sentiment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once now.
    Run {
        /// Search term; repeat for several. Replaces the configured queries.
        #[arg(long = "query")]
        queries: Vec<String>,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Create the news table if it is missing.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run {
        queries: Vec::new(),
        page_size: None,
    }) {
        Commands::Run { queries, page_size } => {
            config.apply_file(&PipelineFile {
                queries: (!queries.is_empty()).then_some(queries),
                page_size,
                ..Default::default()
            })?;
            let summary = run_once_with_config(&config).await?;
            println!(
                "run complete: run_id={} extracted={} normalized={} classified={} inserted={} total_rows={}",
                summary.run_id,
                summary.extracted,
                summary.normalized,
                summary.classified,
                summary.inserted,
                summary.total_rows
            );
            if let Some(manifest) = &summary.manifest_path {
                println!("manifest: {manifest}");
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!(SCHEDULER_DISABLED);
            }
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let Some(mut scheduler) = maybe_build_scheduler(Arc::clone(&pipeline), &config).await?
            else {
                pipeline.store().close().await;
                bail!(SCHEDULER_DISABLED);
            };
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running with cron {:?}; Ctrl-C to stop", config.cron);
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
            pipeline.store().close().await;
        }
        Commands::InitDb => {
            let branch = init_schema(&config).await?;
            println!("schema ready: {branch:?}");
        }
    }

    Ok(())
}
