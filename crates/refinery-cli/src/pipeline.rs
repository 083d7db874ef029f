//! Pipeline command handlers for the CLI.

use std::fmt::Write as _;

use chrono::Utc;
use clap::Subcommand;
use refinery_core::{AppConfig, PipelineRun, RefineryStore};
use refinery_pipeline::{run_cleanup, run_pipeline, PipelineConfig, PipelineError};

/// Sub-commands available under `pipeline`.
#[derive(Debug, Subcommand)]
pub enum PipelineCommands {
    /// Run the pipeline once over the pending captures
    Run {
        /// Print the full run record as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show recent pipeline runs, newest first
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

pub(crate) async fn run(
    store: &dyn RefineryStore,
    config: &AppConfig,
    command: PipelineCommands,
) -> anyhow::Result<()> {
    match command {
        PipelineCommands::Run { json } => run_once(store, config, json).await,
        PipelineCommands::Runs { limit } => {
            let runs = store.list_pipeline_runs(limit.clamp(1, 200)).await?;
            if runs.is_empty() {
                println!("no pipeline runs recorded");
            }
            for run in &runs {
                println!("{}", format_run_line(run));
            }
            Ok(())
        }
    }
}

/// Run the pipeline once with `cli` as the trigger source.
///
/// # Errors
///
/// Returns an error if the model client cannot be built, another run is in
/// flight, or the run record cannot be written. Per-capture and per-cluster
/// failures are reported in the run, not as an error.
async fn run_once(store: &dyn RefineryStore, config: &AppConfig, json: bool) -> anyhow::Result<()> {
    let extractor = refinery_pipeline::anthropic_client(config)
        .map_err(|e| anyhow::anyhow!("failed to build the model client: {e}"))?;
    let pipeline = PipelineConfig::from_app_config(config);

    let run = match run_pipeline(store, &extractor, &pipeline, "cli").await {
        Ok(run) => run,
        Err(PipelineError::AlreadyRunning) => {
            anyhow::bail!("a pipeline run is already in progress; try again once it finishes")
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print!("{}", format_run_summary(&run));
    }
    Ok(())
}

pub(crate) async fn run_cleanup_once(store: &dyn RefineryStore) -> anyhow::Result<()> {
    let report = run_cleanup(store, Utc::now()).await?;
    println!(
        "expired {} card(s), pruned {} nonce(s), failed {} stale run(s)",
        report.cards_expired, report.nonces_pruned, report.stale_runs_failed
    );
    Ok(())
}

pub(crate) fn format_run_line(run: &PipelineRun) -> String {
    format!(
        "{}  {:<9}  {:<9}  started {}  captures {}  briefs {}  tokens {}  errors {}",
        run.id,
        run.status.as_str(),
        run.trigger_source,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.captures_processed,
        run.strategist.briefs_generated,
        run.total_tokens_used,
        run.errors.len(),
    )
}

pub(crate) fn format_run_summary(run: &PipelineRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {} {}", run.id, run.status);
    let _ = writeln!(out, "  captures processed: {}", run.captures_processed);
    let _ = writeln!(
        out,
        "  scrubber: {} in, {} passed, {} failed batches",
        run.scrubber.input, run.scrubber.passed, run.scrubber.failed
    );
    let _ = writeln!(
        out,
        "  pattern matcher: {} clusters, {} qualifying",
        run.pattern_matcher.clusters_found, run.pattern_matcher.clusters_qualifying
    );
    let _ = writeln!(
        out,
        "  strategist: {} briefs, {} failed",
        run.strategist.briefs_generated, run.strategist.failed
    );
    let _ = writeln!(out, "  tokens used: {}", run.total_tokens_used);
    for error in &run.errors {
        let _ = writeln!(out, "  - {error}");
    }
    out
}
