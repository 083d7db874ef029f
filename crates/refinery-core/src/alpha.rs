//! Alpha Cards: the intelligence briefs synthesized from qualifying clusters.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::refinery::Direction;
use crate::validate::{require_finite, require_non_empty, require_range, Validate, ValidationError};

/// Lifetime of a freshly synthesized card.
pub const ALPHA_CARD_TTL_HOURS: i64 = 72;

const MAX_NAME_IDEAS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlphaCategory {
    /// Significant change in developer adoption or sentiment.
    MomentumShift,
    /// Pain point creating a market opportunity.
    FrictionOpportunity,
    /// New tool gaining rapid traction.
    EmergingTool,
    /// Counter-narrative worth investigating.
    ContrarianSignal,
}

text_enum!(AlphaCategory {
    MomentumShift => "momentum_shift",
    FrictionOpportunity => "friction_opportunity",
    EmergingTool => "emerging_tool",
    ContrarianSignal => "contrarian_signal",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Active,
    Expired,
    Archived,
}

text_enum!(CardStatus {
    Active => "active",
    Expired => "expired",
    Archived => "archived",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceQuote {
    pub post_id: String,
    pub author: String,
    pub snippet: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MvpWeek {
    pub week: u32,
    pub goal: String,
    pub tasks: Vec<String>,
}

/// The "build this" product plan attached to a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Blueprint {
    pub product_concept: String,
    /// Between one and five suggestions.
    pub name_ideas: Vec<String>,
    pub mvp_weeks: Vec<MvpWeek>,
    pub monetization: String,
    pub tech_stack: Vec<String>,
    pub estimated_tam: String,
}

/// A synthesized brief. Fields from `thesis` through `blueprint` are pro-only
/// and are nulled together by [`crate::gate_alpha_card`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaCard {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CardStatus,
    pub title: String,
    pub category: AlphaCategory,
    pub entities: Vec<String>,
    pub momentum_score: f64,
    pub direction: Direction,
    pub signal_count: u32,
    pub thesis: Option<String>,
    pub strategy: Option<String>,
    pub risk_factors: Option<Vec<String>>,
    pub evidence: Option<Vec<EvidenceQuote>>,
    pub friction_detail: Option<String>,
    pub opportunity_window: Option<String>,
    pub blueprint: Option<Blueprint>,
    pub cluster_id: Uuid,
}

/// What the strategist model is asked to return. Bookkeeping fields (`id`,
/// timestamps, `status`, `cluster_id`) are stamped afterwards; the free-tier
/// metrics fall back to the cluster's values when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AlphaDraft {
    pub title: String,
    pub category: AlphaCategory,
    #[serde(default)]
    pub entities: Option<Vec<String>>,
    #[serde(default)]
    pub momentum_score: Option<f64>,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub signal_count: Option<u32>,
    #[serde(default)]
    pub thesis: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub risk_factors: Option<Vec<String>>,
    #[serde(default)]
    pub evidence: Option<Vec<EvidenceQuote>>,
    #[serde(default)]
    pub friction_detail: Option<String>,
    #[serde(default)]
    pub opportunity_window: Option<String>,
    #[serde(default)]
    pub blueprint: Option<Blueprint>,
}

impl AlphaCard {
    /// Whether the card is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl Validate for Blueprint {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("blueprint.product_concept", &self.product_concept)?;

        if self.name_ideas.is_empty() || self.name_ideas.len() > MAX_NAME_IDEAS {
            return Err(ValidationError::new(
                "blueprint.name_ideas",
                format!(
                    "expected 1-{MAX_NAME_IDEAS} name ideas, got {}",
                    self.name_ideas.len()
                ),
            ));
        }

        if self.mvp_weeks.is_empty() {
            return Err(ValidationError::new(
                "blueprint.mvp_weeks",
                "at least one MVP week is required",
            ));
        }

        for week in &self.mvp_weeks {
            if week.week < 1 {
                return Err(ValidationError::new(
                    "blueprint.mvp_weeks.week",
                    "week numbers start at 1",
                ));
            }
            require_non_empty("blueprint.mvp_weeks.goal", &week.goal)?;
        }

        Ok(())
    }
}

impl Validate for AlphaCard {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("title", &self.title)?;
        if self.entities.is_empty() {
            return Err(ValidationError::new("entities", "must not be empty"));
        }
        require_range("momentum_score", self.momentum_score, 0.0, 100.0)?;

        if self.expires_at <= self.created_at {
            return Err(ValidationError::new(
                "expires_at",
                "must be later than created_at",
            ));
        }

        if let Some(evidence) = &self.evidence {
            for quote in evidence {
                require_non_empty("evidence.post_id", &quote.post_id)?;
                require_finite("evidence.relevance", quote.relevance)?;
            }
        }

        if let Some(blueprint) = &self.blueprint {
            blueprint.validate()?;
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{blueprint, card};
    use super::*;

    #[test]
    fn complete_card_is_valid() {
        assert!(card().validate().is_ok());
    }

    #[test]
    fn blueprint_requires_name_ideas_within_bounds() {
        let mut b = blueprint();
        b.name_ideas.clear();
        assert_eq!(b.validate().unwrap_err().field, "blueprint.name_ideas");

        b.name_ideas = (0..6).map(|i| format!("name-{i}")).collect();
        assert_eq!(b.validate().unwrap_err().field, "blueprint.name_ideas");
    }

    #[test]
    fn blueprint_requires_an_mvp_week() {
        let mut b = blueprint();
        b.mvp_weeks.clear();
        assert_eq!(b.validate().unwrap_err().field, "blueprint.mvp_weeks");
    }

    #[test]
    fn card_with_expiry_before_creation_is_invalid() {
        let mut c = card();
        c.expires_at = c.created_at;
        assert_eq!(c.validate().unwrap_err().field, "expires_at");
    }

    #[test]
    fn gated_card_shape_is_still_valid() {
        let mut c = card();
        c.thesis = None;
        c.blueprint = None;
        c.evidence = None;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn draft_accepts_missing_free_tier_metrics() {
        let json = serde_json::json!({
            "title": "Bun eats into Node tooling",
            "category": "emerging_tool",
            "thesis": "Startup time matters"
        });
        let draft: AlphaDraft = serde_json::from_value(json).expect("deserialize draft");
        assert!(draft.entities.is_none());
        assert_eq!(draft.category, AlphaCategory::EmergingTool);
    }
}
