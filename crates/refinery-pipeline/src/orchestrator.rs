//! Sequences the three refinery stages over pending work and records the run.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use refinery_core::{
    CaptureRecord, CaptureStatus, PipelineRun, RefineryStore, RunStatus, StoreError, Validate,
    ValidationError,
};
use refinery_llm::StructuredExtractor;
use thiserror::Error;

use crate::pattern_matcher::{run_pattern_matcher, WINDOW_HOURS};
use crate::scrubber::{run_scrubber, ScrubberError, ScrubberResult};
use crate::strategist::synthesize_alpha_card;
use crate::PipelineConfig;

/// Captures pulled per run, oldest first.
pub const CAPTURES_PER_RUN: i64 = 10;

/// Cluster history consulted for momentum deltas.
pub const PRIOR_CLUSTER_LIMIT: i64 = 100;

pub const NO_PENDING_CAPTURES: &str = "No pending captures to process";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunAlreadyRunning => Self::AlreadyRunning,
            other => Self::Store(other),
        }
    }
}

/// Failure that ends a run early and marks it failed.
#[derive(Debug, Error)]
enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pattern matcher produced an invalid cluster: {0}")]
    InvalidCluster(#[from] ValidationError),
}

/// Failure confined to one capture.
#[derive(Debug, Error)]
enum CaptureError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scrubber(#[from] ScrubberError),
}

/// Runs the pipeline once.
///
/// Claims the single running slot, scrubs up to [`CAPTURES_PER_RUN`]
/// pending captures, clusters the last [`WINDOW_HOURS`] of output, and
/// synthesizes a card per qualifying cluster. Failures of one capture or one
/// cluster are recorded on the run and do not stop the rest. The run record
/// is finalized whether the run completes or fails.
///
/// # Errors
///
/// Returns [`PipelineError::AlreadyRunning`] when another run holds the
/// slot, or [`PipelineError::Store`] if the run record itself cannot be
/// written.
pub async fn run_pipeline<S, E>(
    store: &S,
    extractor: &E,
    config: &PipelineConfig,
    trigger_source: &str,
) -> Result<PipelineRun, PipelineError>
where
    S: RefineryStore + ?Sized,
    E: StructuredExtractor + ?Sized,
{
    let mut run = PipelineRun::start(trigger_source, Utc::now());
    store.start_pipeline_run(&run).await?;
    tracing::info!(run_id = %run.id, trigger = trigger_source, "pipeline run started");

    let status = match execute(store, extractor, config, &mut run).await {
        Ok(()) => RunStatus::Completed,
        Err(e) => {
            tracing::error!(run_id = %run.id, error = %e, "pipeline run failed");
            run.errors.push(e.to_string());
            RunStatus::Failed
        }
    };

    run.status = status;
    run.completed_at = Some(Utc::now());
    if let Err(e) = run.validate() {
        run.status = RunStatus::Failed;
        run.errors.push(format!("invalid run record: {e}"));
    }
    if let Err(e) = store.finalize_pipeline_run(&run).await {
        tracing::error!(
            run_id = %run.id,
            error = %e,
            "failed to finalize pipeline run; it stays running until cleanup fails it"
        );
        return Err(e.into());
    }

    tracing::info!(
        run_id = %run.id,
        status = %run.status,
        captures = run.captures_processed,
        briefs = run.strategist.briefs_generated,
        tokens = run.total_tokens_used,
        errors = run.errors.len(),
        "pipeline run finished"
    );

    Ok(run)
}

async fn execute<S, E>(
    store: &S,
    extractor: &E,
    config: &PipelineConfig,
    run: &mut PipelineRun,
) -> Result<(), StageError>
where
    S: RefineryStore + ?Sized,
    E: StructuredExtractor + ?Sized,
{
    let pending = store.list_pending_captures(CAPTURES_PER_RUN).await?;
    if pending.is_empty() {
        run.errors.push(NO_PENDING_CAPTURES.to_string());
        return Ok(());
    }

    for record in &pending {
        let capture_id = record.capture.capture_id;
        match scrub_capture(store, extractor, config, record, run).await {
            Ok(result) => {
                run.captures_processed += 1;
                for batch in result.batch_errors {
                    run.errors.push(format!(
                        "scrubber batch {} (capture {capture_id}): {}",
                        batch.batch_index, batch.message
                    ));
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(%capture_id, error = %message, "capture failed");
                run.errors
                    .push(format!("scrubber capture {capture_id}: {message}"));
                if let Err(mark) = store
                    .set_capture_status(capture_id, CaptureStatus::Failed, Some(&message))
                    .await
                {
                    tracing::error!(%capture_id, error = %mark, "failed to mark capture failed");
                }
            }
        }
    }

    let now = Utc::now();
    let since = now - Duration::hours(i64::from(WINDOW_HOURS));
    let outputs = store.list_scrubber_outputs_since(since).await?;
    let previous = store.list_recent_clusters(PRIOR_CLUSTER_LIMIT).await?;

    let matched = run_pattern_matcher(&outputs, &previous, now)?;
    run.pattern_matcher.clusters_found = count_u32(matched.clusters.len());
    run.pattern_matcher.clusters_qualifying = count_u32(matched.qualifying.len());
    if !matched.qualifying.is_empty() {
        store.insert_clusters(&matched.qualifying).await?;
    }

    for cluster in &matched.qualifying {
        match synthesize_alpha_card(extractor, config, cluster, &outputs, Utc::now()).await {
            Ok(synthesized) => {
                run.total_tokens_used += synthesized.tokens_used;
                match store.insert_alpha_card(&synthesized.card).await {
                    Ok(()) => run.strategist.briefs_generated += 1,
                    Err(e) => {
                        run.strategist.failed += 1;
                        run.errors
                            .push(format!("strategist cluster {}: {e}", cluster.cluster_id));
                    }
                }
            }
            Err(e) => {
                run.total_tokens_used += e.tokens_used();
                run.strategist.failed += 1;
                tracing::warn!(cluster_id = %cluster.cluster_id, error = %e, "strategist failed");
                run.errors
                    .push(format!("strategist cluster {}: {e}", cluster.cluster_id));
            }
        }
    }

    Ok(())
}

/// Scrubs and persists one capture, advancing it to `processed`.
/// Token and post counts land on `run` even when a later step fails.
async fn scrub_capture<S, E>(
    store: &S,
    extractor: &E,
    config: &PipelineConfig,
    record: &CaptureRecord,
    run: &mut PipelineRun,
) -> Result<ScrubberResult, CaptureError>
where
    S: RefineryStore + ?Sized,
    E: StructuredExtractor + ?Sized,
{
    let capture_id = record.capture.capture_id;
    store
        .set_capture_status(capture_id, CaptureStatus::Processing, None)
        .await?;

    let posts = &record.capture.posts;
    run.scrubber.input += count_u32(posts.len());

    let post_ids: Vec<String> = posts.iter().map(|p| p.post_id.clone()).collect();
    let processed: HashSet<String> = store.filter_processed_post_ids(&post_ids).await?;

    let result = match run_scrubber(extractor, config, capture_id, posts, &processed).await {
        Ok(result) => result,
        Err(e) => {
            run.total_tokens_used += e.tokens_used();
            return Err(e.into());
        }
    };
    run.total_tokens_used += result.tokens_used;
    run.scrubber.passed += result.output.total_passed;
    run.scrubber.failed += count_u32(result.batch_errors.len());

    store.insert_scrubber_output(&result.output).await?;
    store.mark_posts_processed(capture_id, &post_ids).await?;
    store
        .set_capture_status(capture_id, CaptureStatus::Processed, None)
        .await?;

    Ok(result)
}

fn count_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
