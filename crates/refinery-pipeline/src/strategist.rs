//! Third refinery stage: turn one qualifying cluster into an Alpha Card.

use chrono::{DateTime, Duration, Utc};
use refinery_core::{
    AlphaCard, AlphaDraft, CardStatus, PatternCluster, ScrubberOutput, Validate,
    ValidationError, ALPHA_CARD_TTL_HOURS,
};
use refinery_llm::{schema_for, ExtractionRequest, LlmError, StructuredExtractor};
use thiserror::Error;
use uuid::Uuid;

use crate::PipelineConfig;

const SYSTEM_PROMPT: &str = r#"You are a venture intelligence strategist. You transform technical signal clusters into actionable market intelligence ("Alpha Cards") for indie hackers, founders, and technical builders who want to find and capitalize on emerging opportunities.

Your output must be:
- Specific and actionable, not generic
- Time-bound with clear opportunity windows
- Evidence-backed with concrete examples
- Risk-aware with honest assessment of uncertainties
- Include a "Build This" blueprint: a concrete product idea with a buildable MVP plan

Categories:
- momentum_shift: Significant change in developer adoption/sentiment
- friction_opportunity: Pain point creating market opportunity
- emerging_tool: New tool gaining rapid traction
- contrarian_signal: Counter-narrative worth investigating"#;

const CARD_REQUIREMENTS: &str = r#"Generate a structured Alpha Card with:
1. A compelling, specific title
2. Correct category classification
3. A thesis explaining the opportunity
4. A concrete strategy for capitalizing on this signal
5. Risk factors to consider
6. Evidence supporting the thesis
7. Friction details if applicable
8. An opportunity window estimate
9. A "Build This" blueprint containing:
   - product_concept: A specific, concrete product/tool/SaaS idea that names exactly what it does
   - name_ideas: 3 catchy product name suggestions
   - mvp_weeks: A 3-4 week MVP plan where each week has a goal and specific tasks
   - monetization: A specific monetization strategy (pricing model, target price point, who pays)
   - tech_stack: Recommended technologies to build it with
   - estimated_tam: Rough total addressable market estimate based on the signals"#;

#[derive(Debug, Error)]
pub enum StrategistError {
    #[error(transparent)]
    Extraction(#[from] LlmError),
    #[error("synthesized card failed validation: {source}")]
    InvalidCard {
        source: ValidationError,
        tokens_used: u64,
    },
}

impl StrategistError {
    /// Tokens billed for the failed attempt.
    #[must_use]
    pub fn tokens_used(&self) -> u64 {
        match self {
            Self::Extraction(e) => e.tokens_used(),
            Self::InvalidCard { tokens_used, .. } => *tokens_used,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedCard {
    pub card: AlphaCard,
    pub tokens_used: u64,
}

/// Renders the evidence document the model reasons over.
///
/// Friction points are included when their entity equals a cluster entity
/// ignoring case; notable posts when their id is in the cluster's evidence.
#[must_use]
pub fn build_context(cluster: &PatternCluster, outputs: &[ScrubberOutput]) -> String {
    let mut friction_lines = Vec::new();
    let mut insight_lines = Vec::new();

    for output in outputs {
        for point in &output.friction_points {
            let entity = point.entity.to_lowercase();
            if cluster.entities.iter().any(|e| e.to_lowercase() == entity) {
                friction_lines.push(format!(
                    "- [{}] {}: {}",
                    point.severity, point.entity, point.signal
                ));
            }
        }
        for notable in &output.notable_mentions {
            if cluster.evidence_post_ids.contains(&notable.post_id) {
                insight_lines.push(format!(
                    "- post {} (relevance: {}): {}",
                    notable.post_id, notable.relevance_score, notable.extracted_insight
                ));
            }
        }
    }

    format!(
        "## Cluster Analysis
Entities: {}
Momentum Score: {}/100 ({}, delta: {})
Friction Density: {}
Evidence Posts: {}
Window: {}h

## Friction Points
{}

## Key Insights
{}",
        cluster.entities.join(", "),
        cluster.momentum_score,
        cluster.direction,
        cluster.momentum_delta,
        cluster.friction_density,
        cluster.evidence_post_ids.len(),
        cluster.window_hours,
        if friction_lines.is_empty() {
            "None identified".to_string()
        } else {
            friction_lines.join("\n")
        },
        if insight_lines.is_empty() {
            "No specific insights extracted".to_string()
        } else {
            insight_lines.join("\n")
        },
    )
}

/// Synthesizes a card for `cluster` with one call to the strategist model.
///
/// # Errors
///
/// Returns [`StrategistError::Extraction`] when the call fails or its payload
/// does not match the card draft, and [`StrategistError::InvalidCard`] when
/// the assembled card breaks its invariants. Both carry the tokens spent.
pub async fn synthesize_alpha_card<E>(
    extractor: &E,
    config: &PipelineConfig,
    cluster: &PatternCluster,
    outputs: &[ScrubberOutput],
    now: DateTime<Utc>,
) -> Result<SynthesizedCard, StrategistError>
where
    E: StructuredExtractor + ?Sized,
{
    let context = build_context(cluster, outputs);
    let request = ExtractionRequest {
        model: config.strategist_model.clone(),
        system: SYSTEM_PROMPT.to_string(),
        prompt: format!(
            "Based on this technical signal cluster, generate a complete Alpha Card intelligence brief with a \"Build This\" blueprint.\n\n{context}\n\n{CARD_REQUIREMENTS}"
        ),
        schema: schema_for::<AlphaDraft>(),
        max_tokens: config.max_tokens,
    };

    let extraction = extractor.extract(&request).await?;
    let draft: AlphaDraft = extraction.parse()?;
    let tokens_used = extraction.tokens_used;

    let card = assemble_card(draft, cluster, now);
    card.validate()
        .map_err(|source| StrategistError::InvalidCard {
            source,
            tokens_used,
        })?;

    tracing::info!(
        cluster_id = %cluster.cluster_id,
        card_id = %card.id,
        category = %card.category,
        tokens_used,
        "strategist synthesized card"
    );

    Ok(SynthesizedCard { card, tokens_used })
}

/// Stamps bookkeeping fields onto `draft`; free-tier metrics the model left
/// out come from the cluster.
fn assemble_card(draft: AlphaDraft, cluster: &PatternCluster, now: DateTime<Utc>) -> AlphaCard {
    let entities = draft
        .entities
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| cluster.entities.clone());
    let signal_count = draft.signal_count.unwrap_or_else(|| {
        u32::try_from(cluster.evidence_post_ids.len()).unwrap_or(u32::MAX)
    });

    AlphaCard {
        id: Uuid::new_v4(),
        created_at: now,
        expires_at: now + Duration::hours(ALPHA_CARD_TTL_HOURS),
        status: CardStatus::Active,
        title: draft.title,
        category: draft.category,
        entities,
        momentum_score: draft.momentum_score.unwrap_or(cluster.momentum_score),
        direction: draft.direction.unwrap_or(cluster.direction),
        signal_count,
        thesis: draft.thesis,
        strategy: draft.strategy,
        risk_factors: draft.risk_factors,
        evidence: draft.evidence,
        friction_detail: draft.friction_detail,
        opportunity_window: draft.opportunity_window,
        blueprint: draft.blueprint,
        cluster_id: cluster.cluster_id,
    }
}

#[cfg(test)]
mod tests {
    use refinery_core::{AlphaCategory, Direction, FrictionPoint, NotableMention, Severity};
    use serde_json::json;

    use super::*;
    use crate::test_support::{cluster, extraction, strategist_draft, ScriptedExtractor};

    fn output() -> ScrubberOutput {
        ScrubberOutput {
            capture_id: Uuid::new_v4(),
            processed_at: Utc::now(),
            total_input: 4,
            total_passed: 3,
            entities: vec![],
            friction_points: vec![
                FrictionPoint {
                    entity: "Svelte".to_string(),
                    signal: "runes broke stores".to_string(),
                    source_post_ids: vec!["p1".to_string()],
                    severity: Severity::High,
                },
                FrictionPoint {
                    entity: "sveltekit".to_string(),
                    signal: "adapter churn".to_string(),
                    source_post_ids: vec!["p9".to_string()],
                    severity: Severity::Low,
                },
            ],
            notable_mentions: vec![
                NotableMention {
                    post_id: "p2".to_string(),
                    relevance_score: 0.8,
                    extracted_insight: "teams pause upgrades".to_string(),
                },
                NotableMention {
                    post_id: "elsewhere".to_string(),
                    relevance_score: 0.9,
                    extracted_insight: "unrelated".to_string(),
                },
            ],
        }
    }

    #[test]
    fn context_uses_exact_case_insensitive_entity_matches() {
        let context = build_context(&cluster(), &[output()]);

        assert!(context.contains("Entities: react, svelte"));
        assert!(context.contains("Momentum Score: 42.5/100 (rising, delta: 12.5)"));
        assert!(context.contains("Evidence Posts: 3"));
        assert!(context.contains("Window: 48h"));
        assert!(context.contains("- [high] Svelte: runes broke stores"));
        assert!(!context.contains("sveltekit"));
        assert!(context.contains("- post p2 (relevance: 0.8): teams pause upgrades"));
        assert!(!context.contains("unrelated"));
    }

    #[test]
    fn empty_context_sections_have_placeholders() {
        let context = build_context(&cluster(), &[]);
        assert!(context.contains("## Friction Points\nNone identified"));
        assert!(context.contains("## Key Insights\nNo specific insights extracted"));
    }

    #[tokio::test]
    async fn card_is_stamped_from_the_cluster() {
        let extractor = ScriptedExtractor::new(|_| Ok(extraction(strategist_draft(), 900)));
        let cluster = cluster();
        let now = Utc::now();

        let synthesized = synthesize_alpha_card(
            &extractor,
            &PipelineConfig::default(),
            &cluster,
            &[output()],
            now,
        )
        .await
        .expect("synthesize");

        let card = synthesized.card;
        assert_eq!(synthesized.tokens_used, 900);
        assert_eq!(card.cluster_id, cluster.cluster_id);
        assert_eq!(card.status, CardStatus::Active);
        assert_eq!(card.created_at, now);
        assert_eq!(card.expires_at - card.created_at, Duration::hours(72));
        assert_eq!(card.entities, cluster.entities);
        assert!((card.momentum_score - cluster.momentum_score).abs() < f64::EPSILON);
        assert_eq!(card.direction, Direction::Rising);
        assert_eq!(card.signal_count, 3);
        assert_eq!(card.category, AlphaCategory::FrictionOpportunity);

        let request = &extractor.requests()[0];
        assert_eq!(request.model, PipelineConfig::default().strategist_model);
        assert!(request.prompt.contains("## Cluster Analysis"));
    }

    #[tokio::test]
    async fn model_supplied_free_fields_win() {
        let mut draft = strategist_draft();
        draft["entities"] = json!(["react", "svelte", "vite"]);
        draft["signal_count"] = json!(11);
        draft["direction"] = json!("stable");
        let extractor = ScriptedExtractor::new(move |_| Ok(extraction(draft.clone(), 10)));

        let synthesized = synthesize_alpha_card(
            &extractor,
            &PipelineConfig::default(),
            &cluster(),
            &[],
            Utc::now(),
        )
        .await
        .expect("synthesize");

        assert_eq!(synthesized.card.entities.len(), 3);
        assert_eq!(synthesized.card.signal_count, 11);
        assert_eq!(synthesized.card.direction, Direction::Stable);
    }

    #[tokio::test]
    async fn blueprint_without_name_ideas_is_rejected_with_tokens() {
        let mut draft = strategist_draft();
        draft["blueprint"]["name_ideas"] = json!([]);
        let extractor = ScriptedExtractor::new(move |_| Ok(extraction(draft.clone(), 77)));

        let err = synthesize_alpha_card(
            &extractor,
            &PipelineConfig::default(),
            &cluster(),
            &[],
            Utc::now(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StrategistError::InvalidCard { .. }));
        assert_eq!(err.tokens_used(), 77);
    }

    #[tokio::test]
    async fn unknown_category_is_a_schema_error() {
        let mut draft = strategist_draft();
        draft["category"] = json!("hot_take");
        let extractor = ScriptedExtractor::new(move |_| Ok(extraction(draft.clone(), 40)));

        let err = synthesize_alpha_card(
            &extractor,
            &PipelineConfig::default(),
            &cluster(),
            &[],
            Utc::now(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            StrategistError::Extraction(LlmError::SchemaMismatch { tokens_used: 40, .. })
        ));
    }
}
