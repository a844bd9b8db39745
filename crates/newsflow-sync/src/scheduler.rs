//! Cron trigger for scheduled runs.
//!
//! Each firing builds a fresh [`PipelineRun`](newsflow_core::PipelineRun). Firings missed
//! while the process was down are not replayed, and a firing that lands while a run is
//! still active is skipped.

use std::sync::Arc;

use anyhow::{Context, Result};
use newsflow_core::RunTrigger;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::pipeline::{NewsPipeline, RunSummary};
use crate::retry::RunError;

/// Register the pipeline job. The scheduler is returned unstarted.
pub async fn build_scheduler(
    pipeline: Arc<NewsPipeline>,
    config: &PipelineConfig,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let config = Arc::new(config.clone());
    let cron = config.cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        let config = Arc::clone(&config);

        Box::pin(async move {
            fire(&pipeline, &config).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;

    scheduler.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "scheduler: registered pipeline job");
    Ok(scheduler)
}

/// One scheduled firing. `None` when another run still holds the pipeline.
pub async fn fire(
    pipeline: &NewsPipeline,
    config: &PipelineConfig,
) -> Option<Result<RunSummary, RunError>> {
    let outcome = pipeline
        .try_run_once(config.new_run(RunTrigger::Scheduled))
        .await;
    match &outcome {
        Some(Ok(summary)) => info!(
            run_id = %summary.run_id,
            inserted = summary.inserted,
            "scheduler: run complete"
        ),
        Some(Err(err)) => error!(error = %err, "scheduler: run failed"),
        None => {}
    }
    outcome
}

/// `None` when scheduling is disabled in config.
pub async fn maybe_build_scheduler(
    pipeline: Arc<NewsPipeline>,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, config).await.map(Some)
}
