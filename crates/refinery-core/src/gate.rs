//! Tier gating for Alpha Cards leaving the system boundary.

use serde::{Deserialize, Serialize};

use crate::alpha::AlphaCard;

/// Caller tier at the read boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Free,
    Pro,
}

text_enum!(AccessTier {
    Free => "free",
    Pro => "pro",
});

/// Names of the fields withheld from free-tier callers.
pub const PRO_FIELDS: [&str; 7] = [
    "thesis",
    "strategy",
    "risk_factors",
    "evidence",
    "friction_detail",
    "opportunity_window",
    "blueprint",
];

/// Returns a copy of `card` fit for `tier`.
///
/// `Free` nulls every pro-only field together; `Pro` returns the card as is.
/// The input is never modified and gating a gated card is a no-op.
#[must_use]
pub fn gate_alpha_card(card: &AlphaCard, tier: AccessTier) -> AlphaCard {
    match tier {
        AccessTier::Pro => card.clone(),
        AccessTier::Free => AlphaCard {
            thesis: None,
            strategy: None,
            risk_factors: None,
            evidence: None,
            friction_detail: None,
            opportunity_window: None,
            blueprint: None,
            ..card.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpha::fixtures::card;

    #[test]
    fn free_tier_nulls_exactly_the_pro_fields() {
        let original = card();
        let gated = gate_alpha_card(&original, AccessTier::Free);

        let gated_json = serde_json::to_value(&gated).expect("serialize gated");
        let original_json = serde_json::to_value(&original).expect("serialize original");
        let gated_obj = gated_json.as_object().expect("object");
        let original_obj = original_json.as_object().expect("object");

        for (key, value) in gated_obj {
            if PRO_FIELDS.contains(&key.as_str()) {
                assert!(value.is_null(), "{key} should be null for free tier");
            } else {
                assert_eq!(value, &original_obj[key], "{key} should be untouched");
            }
        }
        assert_eq!(gated_obj.len(), original_obj.len());
    }

    #[test]
    fn free_tier_does_not_mutate_input() {
        let original = card();
        let snapshot = original.clone();
        let _ = gate_alpha_card(&original, AccessTier::Free);
        assert_eq!(original, snapshot);
    }

    #[test]
    fn pro_tier_returns_equal_card() {
        let original = card();
        assert_eq!(gate_alpha_card(&original, AccessTier::Pro), original);
    }

    #[test]
    fn gating_is_idempotent() {
        let once = gate_alpha_card(&card(), AccessTier::Free);
        let twice = gate_alpha_card(&once, AccessTier::Free);
        assert_eq!(once, twice);
    }
}
