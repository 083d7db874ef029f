//! Second refinery stage: co-occurrence clustering and momentum scoring over
//! the recent scrubber outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use refinery_core::{
    cluster_identity_key, Direction, PatternCluster, ScrubberOutput, Validate, ValidationError,
};
use uuid::Uuid;

/// Distinct supporting posts a pair needs before it becomes a cluster.
pub const MINIMUM_CO_OCCURRENCE: usize = 3;

/// Score at or above which a cluster is handed to the strategist.
pub const MOMENTUM_THRESHOLD: f64 = 30.0;

/// Width of the rolling observation window.
pub const WINDOW_HOURS: u32 = 48;

/// Relevance above which a notable post is linked to every entity of its
/// output.
const BROAD_RELEVANCE: f64 = 0.5;

/// Directional dead band around the prior score.
const DIRECTION_DEAD_BAND: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MatcherResult {
    /// Every candidate, sorted by identity key.
    pub clusters: Vec<PatternCluster>,
    /// The candidates at or above [`MOMENTUM_THRESHOLD`], same order.
    pub qualifying: Vec<PatternCluster>,
}

/// `min(100, velocity * sqrt(max(density, 0.01)) * max(author_weight, 1))`,
/// floored at zero.
#[must_use]
pub fn compute_momentum(mention_velocity: f64, friction_density: f64, author_weight: f64) -> f64 {
    let raw = mention_velocity * friction_density.max(0.01).sqrt() * author_weight.max(1.0);
    raw.clamp(0.0, 100.0)
}

/// Direction of `current` against the prior score, with a ±5 dead band.
/// A first observation is rising.
#[must_use]
pub fn determine_direction(current: f64, prior: Option<f64>) -> Direction {
    let Some(prior) = prior else {
        return Direction::Rising;
    };
    let delta = current - prior;
    if delta > DIRECTION_DEAD_BAND {
        Direction::Rising
    } else if delta < -DIRECTION_DEAD_BAND {
        Direction::Falling
    } else {
        Direction::Stable
    }
}

/// Builds clusters from `outputs`.
///
/// `previous` is cluster history ordered newest first; the first cluster seen
/// for an identity key supplies the prior score.
///
/// # Errors
///
/// Returns the [`ValidationError`] of the first cluster that breaks its
/// shape invariants.
pub fn run_pattern_matcher(
    outputs: &[ScrubberOutput],
    previous: &[PatternCluster],
    now: DateTime<Utc>,
) -> Result<MatcherResult, ValidationError> {
    let graph = CoOccurrence::build(outputs);

    let mut prior_scores: HashMap<String, f64> = HashMap::new();
    for cluster in previous {
        prior_scores
            .entry(cluster.identity_key())
            .or_insert(cluster.momentum_score);
    }

    let mut clusters = Vec::new();
    for (key, pair) in &graph.pairs {
        if pair.posts.len() < MINIMUM_CO_OCCURRENCE {
            continue;
        }

        let total_mentions: u64 = pair
            .entities
            .iter()
            .map(|e| graph.mentions.get(e).copied().unwrap_or(0))
            .sum();
        let friction_count = pair
            .entities
            .iter()
            .filter(|e| graph.friction.contains(*e))
            .count();

        #[allow(clippy::cast_precision_loss)]
        let (velocity, density, author_weight) = (
            total_mentions as f64 / f64::from(WINDOW_HOURS),
            friction_count as f64 / pair.entities.len() as f64,
            (pair.posts.len() as f64 + 1.0).log2(),
        );
        let score = compute_momentum(velocity, density, author_weight);

        let prior = prior_scores.get(key).copied();
        let direction = determine_direction(score, prior);
        let delta = prior.map_or(score, |p| score - p);

        let cluster = PatternCluster {
            cluster_id: Uuid::new_v4(),
            entities: pair.entities.clone(),
            momentum_score: round2(score),
            momentum_delta: round2(delta),
            direction,
            evidence_post_ids: pair.posts.iter().cloned().collect(),
            friction_density: round2(density),
            first_seen: now,
            window_hours: WINDOW_HOURS,
        };
        cluster.validate()?;
        clusters.push(cluster);
    }

    let qualifying = clusters
        .iter()
        .filter(|c| c.momentum_score >= MOMENTUM_THRESHOLD)
        .cloned()
        .collect();

    tracing::debug!(
        candidates = clusters.len(),
        outputs = outputs.len(),
        "pattern matcher scored clusters"
    );

    Ok(MatcherResult {
        clusters,
        qualifying,
    })
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
struct Pair {
    /// Sorted lowercase names.
    entities: Vec<String>,
    posts: BTreeSet<String>,
}

/// Entity totals and post-level pairings for one window.
#[derive(Debug, Default)]
struct CoOccurrence {
    mentions: HashMap<String, u64>,
    friction: HashSet<String>,
    /// Keyed by identity key so iteration is in output order.
    pairs: BTreeMap<String, Pair>,
}

impl CoOccurrence {
    fn build(outputs: &[ScrubberOutput]) -> Self {
        let mut graph = Self::default();
        let mut post_entities: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();

        for output in outputs {
            for entity in &output.entities {
                let key = entity.name.to_lowercase();
                *graph.mentions.entry(key.clone()).or_insert(0) += u64::from(entity.mentions);
                if entity.friction_signal {
                    graph.friction.insert(key);
                }
            }

            for point in &output.friction_points {
                let name = point.entity.to_lowercase();
                for post_id in &point.source_post_ids {
                    post_entities
                        .entry(post_id.as_str())
                        .or_default()
                        .insert(name.clone());
                }
            }

            for entity in &output.entities {
                let key = entity.name.to_lowercase();
                for notable in &output.notable_mentions {
                    if notable.relevance_score > BROAD_RELEVANCE
                        || notable.extracted_insight.to_lowercase().contains(&key)
                    {
                        post_entities
                            .entry(notable.post_id.as_str())
                            .or_default()
                            .insert(key.clone());
                    }
                }
            }
        }

        for (post_id, entities) in &post_entities {
            let names: Vec<&String> = entities.iter().collect();
            for (i, a) in names.iter().enumerate() {
                for b in &names[i + 1..] {
                    let members = vec![(*a).clone(), (*b).clone()];
                    let pair = graph
                        .pairs
                        .entry(cluster_identity_key(&members))
                        .or_insert_with(|| Pair {
                            entities: members,
                            posts: BTreeSet::new(),
                        });
                    pair.posts.insert((*post_id).to_string());
                }
            }
        }

        graph
    }
}
