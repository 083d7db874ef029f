//! Extraction and clustering shapes produced by the refinery stages.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validate::{require_finite, require_non_empty, require_range, Validate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Framework,
    Language,
    Tool,
    Platform,
    Protocol,
    Concept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Trend direction of a cluster relative to its previous observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rising,
    Falling,
    Stable,
}

text_enum!(Direction {
    Rising => "rising",
    Falling => "falling",
    Stable => "stable",
});

/// A named technology, tool, or concept extracted from signal posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TechEntity {
    /// Case-insensitive merge key.
    pub name: String,
    pub category: EntityCategory,
    pub sentiment: Sentiment,
    pub friction_signal: bool,
    pub mentions: u32,
}

/// A pain point, bug, or migration irritant tied to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrictionPoint {
    pub entity: String,
    pub signal: String,
    pub source_post_ids: Vec<String>,
    pub severity: Severity,
}

/// A post judged notable, with a relevance score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NotableMention {
    pub post_id: String,
    pub relevance_score: f64,
    pub extracted_insight: String,
}

/// The extraction result for one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrubberOutput {
    pub capture_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub total_input: u32,
    pub total_passed: u32,
    pub entities: Vec<TechEntity>,
    pub friction_points: Vec<FrictionPoint>,
    pub notable_mentions: Vec<NotableMention>,
}

/// A momentum-scored group of co-occurring entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCluster {
    pub cluster_id: Uuid,
    /// Sorted, lowercase entity names.
    pub entities: Vec<String>,
    pub momentum_score: f64,
    pub momentum_delta: f64,
    pub direction: Direction,
    pub evidence_post_ids: Vec<String>,
    pub friction_density: f64,
    pub first_seen: DateTime<Utc>,
    pub window_hours: u32,
}

/// Identity key of an entity set: the sorted names joined with `|`.
#[must_use]
pub fn cluster_identity_key(entities: &[String]) -> String {
    let mut names: Vec<&str> = entities.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.join("|")
}

impl PatternCluster {
    #[must_use]
    pub fn identity_key(&self) -> String {
        cluster_identity_key(&self.entities)
    }
}

impl Validate for TechEntity {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("entities.name", &self.name)
    }
}

impl Validate for FrictionPoint {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("friction_points.entity", &self.entity)
    }
}

impl Validate for NotableMention {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("notable_mentions.post_id", &self.post_id)?;
        require_range(
            "notable_mentions.relevance_score",
            self.relevance_score,
            0.0,
            1.0,
        )
    }
}

impl Validate for ScrubberOutput {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.total_passed > self.total_input {
            return Err(ValidationError::new(
                "total_passed",
                format!(
                    "{} passed exceeds {} input",
                    self.total_passed, self.total_input
                ),
            ));
        }
        self.entities.iter().try_for_each(Validate::validate)?;
        self.friction_points.iter().try_for_each(Validate::validate)?;
        self.notable_mentions.iter().try_for_each(Validate::validate)
    }
}

impl Validate for PatternCluster {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.entities.is_empty() {
            return Err(ValidationError::new("entities", "must not be empty"));
        }
        require_range("momentum_score", self.momentum_score, 0.0, 100.0)?;
        require_finite("momentum_delta", self.momentum_delta)?;
        require_range("friction_density", self.friction_density, 0.0, 1.0)?;
        if self.window_hours == 0 {
            return Err(ValidationError::new("window_hours", "must be positive"));
        }
        Ok(())
    }
}
