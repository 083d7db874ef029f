//! Background job scheduler.
//!
//! Registers the recurring pipeline run and the daily cleanup on a
//! [`JobScheduler`] at server startup.

use chrono::Utc;
use refinery_core::AppConfig;
use refinery_pipeline::{run_cleanup, run_pipeline, PipelineError};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::api::AppState;

/// Builds and starts the background job scheduler.
///
/// Returns the running [`JobScheduler`] handle, which must be kept alive
/// for the lifetime of the process. Dropping it shuts down all jobs.
///
/// # Errors
///
/// Returns [`JobSchedulerError`] if the scheduler cannot be initialised,
/// a cron expression is invalid, or the scheduler fails to start.
pub async fn build_scheduler(
    state: AppState,
    config: &AppConfig,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    register_pipeline_job(&scheduler, state.clone(), &config.pipeline_cron).await?;
    register_cleanup_job(&scheduler, state, &config.cleanup_cron).await?;

    scheduler.start().await?;
    tracing::info!(
        pipeline_cron = %config.pipeline_cron,
        cleanup_cron = %config.cleanup_cron,
        "scheduler started"
    );
    Ok(scheduler)
}

/// Register the recurring pipeline run.
///
/// A tick that finds another run in flight is skipped.
async fn register_pipeline_job(
    scheduler: &JobScheduler,
    state: AppState,
    cron: &str,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let state = state.clone();

        Box::pin(async move {
            tracing::info!("scheduler: starting pipeline run");
            match run_pipeline(&*state.store, &*state.extractor, &state.pipeline, "scheduler").await
            {
                Ok(run) => tracing::info!(
                    run_id = %run.id,
                    status = %run.status,
                    briefs = run.strategist.briefs_generated,
                    "scheduler: pipeline run finished"
                ),
                Err(PipelineError::AlreadyRunning) => {
                    tracing::info!("scheduler: pipeline already running; skipping tick");
                }
                Err(e) => tracing::error!(error = %e, "scheduler: pipeline run failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    Ok(())
}

/// Register the card-expiry and nonce-pruning job.
async fn register_cleanup_job(
    scheduler: &JobScheduler,
    state: AppState,
    cron: &str,
) -> Result<(), JobSchedulerError> {
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let state = state.clone();

        Box::pin(async move {
            if let Err(e) = run_cleanup(&*state.store, Utc::now()).await {
                tracing::error!(error = %e, "scheduler: cleanup failed");
            }
        })
    })?;

    scheduler.add(job).await?;
    Ok(())
}
