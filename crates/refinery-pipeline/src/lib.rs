//! The refinery pipeline: ingest verification, the three processing stages,
//! the orchestrator that sequences them, and periodic maintenance.

pub mod ingest;
pub mod maintenance;
pub mod orchestrator;
pub mod pattern_matcher;
pub mod scrubber;
pub mod strategist;

#[cfg(test)]
mod test_support;

use refinery_core::config::{DEFAULT_SCRUBBER_MODEL, DEFAULT_STRATEGIST_MODEL};
use refinery_core::AppConfig;
use refinery_llm::{AnthropicClient, LlmError, DEFAULT_MAX_TOKENS};

pub use ingest::{IngestRequest, IngestVerifier, VerifyError, VerifyRejection};
pub use maintenance::{run_cleanup, CleanupReport};
pub use orchestrator::{run_pipeline, PipelineError};
pub use pattern_matcher::{compute_momentum, determine_direction, run_pattern_matcher};
pub use scrubber::{run_scrubber, ScrubberError, ScrubberResult};
pub use strategist::{synthesize_alpha_card, StrategistError, SynthesizedCard};

/// Model selection for the two generative stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub scrubber_model: String,
    pub strategist_model: String,
    pub max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scrubber_model: DEFAULT_SCRUBBER_MODEL.to_string(),
            strategist_model: DEFAULT_STRATEGIST_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            scrubber_model: config.scrubber_model.clone(),
            strategist_model: config.strategist_model.clone(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Builds the production model client from `config`, honouring the base-URL
/// override and the retry settings.
///
/// # Errors
///
/// Returns [`LlmError::InvalidConfig`] when `ANTHROPIC_API_KEY` is unset, or
/// any construction error from [`AnthropicClient`].
pub fn anthropic_client(config: &AppConfig) -> Result<AnthropicClient, LlmError> {
    let api_key = config
        .anthropic_api_key
        .as_deref()
        .ok_or_else(|| LlmError::InvalidConfig("ANTHROPIC_API_KEY is not set".to_string()))?;

    let client = match config.llm_base_url.as_deref() {
        Some(base_url) => {
            AnthropicClient::with_base_url(api_key, config.llm_request_timeout_secs, base_url)?
        }
        None => AnthropicClient::new(api_key, config.llm_request_timeout_secs)?,
    };

    Ok(client.with_retry(config.llm_max_retries, config.llm_retry_backoff_ms))
}
