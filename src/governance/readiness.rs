//! BANT deal-readiness scoring.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// BANT checklist keys, in deterministic scoring order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BantKey {
    Budget,
    Authority,
    Need,
    Timeline,
}

pub const ORDERED_BANT_KEYS: [BantKey; 4] = [
    BantKey::Budget,
    BantKey::Authority,
    BantKey::Need,
    BantKey::Timeline,
];

impl BantKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            BantKey::Budget => "budget",
            BantKey::Authority => "authority",
            BantKey::Need => "need",
            BantKey::Timeline => "timeline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "budget" => Some(BantKey::Budget),
            "authority" => Some(BantKey::Authority),
            "need" => Some(BantKey::Need),
            "timeline" => Some(BantKey::Timeline),
            _ => None,
        }
    }
}

/// One piece of BANT evidence attached to a deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealFact {
    pub key: BantKey,
    pub value_json: Value,
    pub confidence: f64,
    pub evidence_json: Value,
}

/// Derived readiness aggregate, recomputed on every fact write.
#[derive(Debug, Clone, PartialEq)]
pub struct BantReadiness {
    pub missing_keys: Vec<BantKey>,
    pub readiness_score: f64,
}

/// Score = (4 - missing) / 4 * 100; missing keys in budget->authority->
/// need->timeline order.
pub fn compute_bant_readiness(facts: &[DealFact]) -> BantReadiness {
    let missing_keys: Vec<BantKey> = ORDERED_BANT_KEYS
        .iter()
        .copied()
        .filter(|key| !facts.iter().any(|fact| fact.key == *key))
        .collect();
    let total = ORDERED_BANT_KEYS.len() as f64;
    let readiness_score = (total - missing_keys.len() as f64) / total * 100.0;
    BantReadiness {
        missing_keys,
        readiness_score,
    }
}

/// Follow-up question for each missing key, in deterministic order.
pub fn suggest_questions(missing_keys: &[BantKey]) -> Vec<String> {
    ORDERED_BANT_KEYS
        .iter()
        .filter(|key| missing_keys.contains(key))
        .map(|key| {
            match key {
                BantKey::Budget => "Do you have a budget range allocated for this?",
                BantKey::Authority => "Who besides you needs to approve this?",
                BantKey::Need => {
                    "What problem are you trying to solve and what happens if you don't solve it?"
                }
                BantKey::Timeline => "When do you need this live?",
            }
            .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(key: BantKey) -> DealFact {
        DealFact {
            key,
            value_json: json!("x"),
            confidence: 0.9,
            evidence_json: json!({}),
        }
    }

    #[test]
    fn empty_facts_score_zero() {
        let readiness = compute_bant_readiness(&[]);
        assert_eq!(readiness.readiness_score, 0.0);
        assert_eq!(readiness.missing_keys, ORDERED_BANT_KEYS.to_vec());
    }

    #[test]
    fn partial_facts_score_proportionally() {
        let readiness = compute_bant_readiness(&[fact(BantKey::Timeline), fact(BantKey::Budget)]);
        assert_eq!(readiness.readiness_score, 50.0);
        assert_eq!(
            readiness.missing_keys,
            vec![BantKey::Authority, BantKey::Need]
        );
    }

    #[test]
    fn full_facts_score_hundred() {
        let facts: Vec<DealFact> = ORDERED_BANT_KEYS.iter().map(|k| fact(*k)).collect();
        let readiness = compute_bant_readiness(&facts);
        assert_eq!(readiness.readiness_score, 100.0);
        assert!(readiness.missing_keys.is_empty());
    }

    #[test]
    fn duplicate_facts_count_once() {
        let readiness = compute_bant_readiness(&[fact(BantKey::Budget), fact(BantKey::Budget)]);
        assert_eq!(readiness.readiness_score, 25.0);
    }

    #[test]
    fn questions_follow_canonical_order() {
        let questions = suggest_questions(&[BantKey::Timeline, BantKey::Budget]);
        assert_eq!(questions.len(), 2);
        assert!(questions[0].contains("budget range"));
        assert!(questions[1].contains("live"));
    }
}
