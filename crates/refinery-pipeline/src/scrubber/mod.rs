//! First refinery stage: filter a capture's posts and extract structured
//! technology signals from the survivors.

mod filter;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use refinery_core::{
    FrictionPoint, NotableMention, PostRecord, ScrubberOutput, TechEntity, Validate,
    ValidationError,
};
use refinery_llm::{schema_for, ExtractionRequest, LlmError, StructuredExtractor};
use schemars::JsonSchema;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

pub use filter::{filter_posts, has_signal, is_noise};

use crate::PipelineConfig;

/// Posts per extraction call.
pub const BATCH_SIZE: usize = 25;

/// Extraction calls in flight at once.
pub const MAX_CONCURRENT_BATCHES: usize = 5;

const POST_PREVIEW_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a tech-market intelligence analyst. Extract structured signals from developer posts.
Focus on: technology shifts, developer friction points, emerging tools, sentiment changes.
Be precise with entity categorization and friction severity assessment.";

/// What the model returns for one batch.
#[derive(Debug, Deserialize, JsonSchema)]
struct BatchExtraction {
    entities: Vec<TechEntity>,
    friction_points: Vec<FrictionPoint>,
    notable_mentions: Vec<NotableMention>,
}

impl Validate for BatchExtraction {
    fn validate(&self) -> Result<(), ValidationError> {
        self.entities.iter().try_for_each(Validate::validate)?;
        self.friction_points.iter().try_for_each(Validate::validate)?;
        self.notable_mentions.iter().try_for_each(Validate::validate)
    }
}

/// A failed extraction call. Other batches are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    pub batch_index: usize,
    pub message: String,
}

#[derive(Debug)]
pub struct ScrubberResult {
    pub output: ScrubberOutput,
    pub tokens_used: u64,
    pub batch_errors: Vec<BatchError>,
}

#[derive(Debug, Error)]
pub enum ScrubberError {
    #[error("scrubber output failed validation: {source}")]
    InvalidOutput {
        source: ValidationError,
        tokens_used: u64,
    },
}

impl ScrubberError {
    /// Tokens spent on the capture before it failed.
    #[must_use]
    pub fn tokens_used(&self) -> u64 {
        match self {
            Self::InvalidOutput { tokens_used, .. } => *tokens_used,
        }
    }
}

/// Scrubs one capture.
///
/// Posts already in `processed` are skipped, the rest go through the noise
/// filter, and survivors are extracted in batches of [`BATCH_SIZE`] with at
/// most [`MAX_CONCURRENT_BATCHES`] calls in flight. Batch results merge in
/// batch order regardless of completion order.
///
/// # Errors
///
/// Returns [`ScrubberError::InvalidOutput`] if the merged output violates its
/// shape invariants. Extraction failures are reported per batch instead.
pub async fn run_scrubber<E>(
    extractor: &E,
    config: &PipelineConfig,
    capture_id: Uuid,
    posts: &[PostRecord],
    processed: &HashSet<String>,
) -> Result<ScrubberResult, ScrubberError>
where
    E: StructuredExtractor + ?Sized,
{
    let fresh = posts.iter().filter(|p| !processed.contains(&p.post_id));
    let signal = filter_posts(fresh);

    let batches: Vec<&[&PostRecord]> = signal.chunks(BATCH_SIZE).collect();
    tracing::info!(
        %capture_id,
        input = posts.len(),
        passed = signal.len(),
        batches = batches.len(),
        "scrubber filtered capture"
    );

    let mut results: Vec<(usize, Result<(BatchExtraction, u64), LlmError>)> =
        stream::iter(
            batches
                .into_iter()
                .enumerate()
                .map(|(index, batch)| async move {
                    (index, extract_batch(extractor, config, batch).await)
                })
                .collect::<Vec<_>>(),
        )
        .buffer_unordered(MAX_CONCURRENT_BATCHES)
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);

    let mut tokens_used = 0u64;
    let mut batch_errors = Vec::new();
    let mut merged = MergedExtraction::default();

    for (batch_index, result) in results {
        match result {
            Ok((extraction, tokens)) => {
                tokens_used += tokens;
                merged.absorb(extraction);
            }
            Err(e) => {
                tokens_used += e.tokens_used();
                tracing::warn!(%capture_id, batch_index, error = %e, "scrubber batch failed");
                batch_errors.push(BatchError {
                    batch_index,
                    message: e.to_string(),
                });
            }
        }
    }

    let output = ScrubberOutput {
        capture_id,
        processed_at: Utc::now(),
        total_input: saturating_u32(posts.len()),
        total_passed: saturating_u32(signal.len()),
        entities: merged.entities,
        friction_points: merged.friction_points,
        notable_mentions: merged.notable_mentions,
    };
    output
        .validate()
        .map_err(|source| ScrubberError::InvalidOutput {
            source,
            tokens_used,
        })?;

    Ok(ScrubberResult {
        output,
        tokens_used,
        batch_errors,
    })
}

async fn extract_batch<E>(
    extractor: &E,
    config: &PipelineConfig,
    batch: &[&PostRecord],
) -> Result<(BatchExtraction, u64), LlmError>
where
    E: StructuredExtractor + ?Sized,
{
    let request = ExtractionRequest {
        model: config.scrubber_model.clone(),
        system: SYSTEM_PROMPT.to_string(),
        prompt: build_prompt(batch),
        schema: schema_for::<BatchExtraction>(),
        max_tokens: config.max_tokens,
    };
    let extraction = extractor.extract(&request).await?;
    let parsed = extraction.parse::<BatchExtraction>()?;
    parsed.validate().map_err(|e| LlmError::SchemaMismatch {
        message: e.to_string(),
        tokens_used: extraction.tokens_used,
    })?;
    Ok((parsed, extraction.tokens_used))
}

fn build_prompt(batch: &[&PostRecord]) -> String {
    let summaries = batch
        .iter()
        .map(|p| {
            let preview: String = p.content.chars().take(POST_PREVIEW_CHARS).collect();
            format!(
                "[{}] @{} ({} followers): {preview}",
                p.post_id, p.author_handle, p.author_followers
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Analyze these developer posts and extract:
1. Tech entities mentioned (frameworks, languages, tools, platforms, protocols, concepts) with sentiment and friction signals
2. Friction points (pain points, bugs, migration issues) with severity and the ids of the posts they come from
3. Notable posts with relevance scores (0-1) and a one-sentence insight

Posts:
{summaries}"
    )
}

/// Accumulates batch results. Entities merge on their lowercase name; the
/// first occurrence keeps its category and sentiment.
#[derive(Debug, Default)]
struct MergedExtraction {
    entities: Vec<TechEntity>,
    by_name: HashMap<String, usize>,
    friction_points: Vec<FrictionPoint>,
    notable_mentions: Vec<NotableMention>,
}

impl MergedExtraction {
    fn absorb(&mut self, batch: BatchExtraction) {
        for entity in batch.entities {
            let key = entity.name.to_lowercase();
            if let Some(&idx) = self.by_name.get(&key) {
                let existing = &mut self.entities[idx];
                existing.mentions = existing.mentions.saturating_add(entity.mentions);
                existing.friction_signal |= entity.friction_signal;
            } else {
                self.by_name.insert(key, self.entities.len());
                self.entities.push(entity);
            }
        }
        self.friction_points.extend(batch.friction_points);
        self.notable_mentions.extend(batch.notable_mentions);
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
