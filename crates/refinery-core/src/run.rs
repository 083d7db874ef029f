//! Pipeline run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validate::{require_non_empty, Validate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// Scrubber layer totals: posts in, posts passing the filter, failed batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubberStats {
    pub input: u32,
    pub passed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherStats {
    pub clusters_found: u32,
    pub clusters_qualifying: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategistStats {
    pub briefs_generated: u32,
    pub failed: u32,
}

/// One execution of the orchestrator. At most one run is `Running` at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub trigger_source: String,
    pub captures_processed: u32,
    pub scrubber: ScrubberStats,
    pub pattern_matcher: MatcherStats,
    pub strategist: StrategistStats,
    pub total_tokens_used: u64,
    pub errors: Vec<String>,
}

impl PipelineRun {
    /// A fresh run in `Running` state with zeroed stats.
    #[must_use]
    pub fn start(trigger_source: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            trigger_source: trigger_source.to_string(),
            captures_processed: 0,
            scrubber: ScrubberStats::default(),
            pattern_matcher: MatcherStats::default(),
            strategist: StrategistStats::default(),
            total_tokens_used: 0,
            errors: Vec::new(),
        }
    }
}

impl Validate for PipelineRun {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("trigger_source", &self.trigger_source)?;

        match (self.status, self.completed_at) {
            (RunStatus::Running, Some(_)) => Err(ValidationError::new(
                "completed_at",
                "a running run has no completion time",
            )),
            (RunStatus::Completed | RunStatus::Failed, None) => Err(ValidationError::new(
                "completed_at",
                "a finished run needs a completion time",
            )),
            (_, Some(done)) if done < self.started_at => Err(ValidationError::new(
                "completed_at",
                "must not precede started_at",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_run_is_valid_and_running() {
        let run = PipelineRun::start("api", Utc::now());
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.validate().is_ok());
    }

    #[test]
    fn completed_run_without_timestamp_is_invalid() {
        let mut run = PipelineRun::start("cli", Utc::now());
        run.status = RunStatus::Completed;
        assert_eq!(run.validate().unwrap_err().field, "completed_at");
    }

    #[test]
    fn run_serializes_layer_stats() {
        let mut run = PipelineRun::start("scheduler", Utc::now());
        run.scrubber.passed = 12;
        let json = serde_json::to_value(&run).expect("serialize run");
        assert_eq!(json["scrubber"]["passed"], 12);
        assert_eq!(json["status"], "running");
    }
}
