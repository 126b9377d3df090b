//! Identification result model and action derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfidenceConfig;

/// How close the runner-up must be to the top candidate for the result
/// to count as ambiguous.
const COMPARABLE_SCORE_GAP: i64 = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WineIdentification {
    pub producer: Option<String>,
    pub wine_name: Option<String>,
    /// Year string or "NV".
    pub vintage: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub wine_type: Option<String>,
    #[serde(default)]
    pub grapes: Vec<String>,
    /// Recognition of a real wine, 0–100.
    #[serde(default)]
    pub confidence: u8,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub wine_name: String,
    pub score: i64,
}

impl WineIdentification {
    /// Tolerant parse of whatever JSON the model produced. Unknown keys
    /// are ignored, confidence is clamped into [0, 100].
    pub fn from_value(value: &Value) -> Self {
        let get_str = |k: &str| value.get(k).and_then(|v| v.as_str()).map(str::to_string);
        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .clamp(0, 100) as u8;
        let grapes = value
            .get("grapes")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|g| g.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let candidates = value
            .get("candidates")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|c| {
                        Some(Candidate {
                            wine_name: c.get("wineName")?.as_str()?.to_string(),
                            score: c.get("score").and_then(|s| s.as_i64()).unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            producer: get_str("producer"),
            wine_name: get_str("wineName"),
            vintage: get_str("vintage"),
            region: get_str("region"),
            country: get_str("country"),
            wine_type: get_str("wineType"),
            grapes,
            confidence,
            candidates,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Top-level fields whose value changed from `self` to `next`, in
    /// deterministic (sorted) key order. Used to emit only the delta
    /// after a refinement.
    pub fn shallow_diff(&self, next: &WineIdentification) -> Vec<(String, Value)> {
        let old = self.to_value();
        let new = next.to_value();
        let (Value::Object(old), Value::Object(new)) = (old, new) else {
            return Vec::new();
        };
        let mut changed: Vec<(String, Value)> = new
            .into_iter()
            .filter(|(k, v)| old.get(k) != Some(v))
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyAction {
    AutoPopulate,
    Suggest,
    Disambiguate,
    UserChoice,
}

/// Derive the client-facing action from the final result.
pub fn derive_action(wine: &WineIdentification, cfg: &ConfidenceConfig) -> IdentifyAction {
    let conf = wine.confidence;

    if conf >= cfg.auto_threshold
        && wine.producer.is_some()
        && wine.wine_name.is_some()
        && wine.vintage.is_some()
    {
        return IdentifyAction::AutoPopulate;
    }

    if is_ambiguous(wine) {
        return IdentifyAction::Disambiguate;
    }

    if conf >= cfg.suggest_threshold && (wine.producer.is_some() || wine.wine_name.is_some()) {
        return IdentifyAction::Suggest;
    }

    IdentifyAction::UserChoice
}

fn is_ambiguous(wine: &WineIdentification) -> bool {
    // Two candidates with comparable scores
    if wine.candidates.len() >= 2 {
        let mut scores: Vec<i64> = wine.candidates.iter().map(|c| c.score).collect();
        scores.sort_unstable_by(|a, b| b.cmp(a));
        if scores[0] - scores[1] <= COMPARABLE_SCORE_GAP {
            return true;
        }
    }
    // Producer-only match against an estate with many wines
    wine.producer.is_some() && wine.wine_name.is_none() && !wine.candidates.is_empty()
}

/// One adopted rung of the escalation ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStep {
    pub tier: String,
    pub model: String,
    pub confidence: u8,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
}

/// The tier path actually traversed. `path` holds the steps whose result
/// was adopted into the running best (so the last entry's confidence
/// always equals the top-level confidence); attempts that failed or did
/// not improve land in `rejected`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub path: Vec<EscalationStep>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rejected: Vec<EscalationStep>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentificationOutcome {
    #[serde(flatten)]
    pub wine: WineIdentification,
    pub action: IdentifyAction,
    pub escalation: Escalation,
}

impl IdentificationOutcome {
    pub fn final_tier(&self) -> &str {
        self.escalation
            .path
            .last()
            .map(|s| s.tier.as_str())
            .unwrap_or("tier1")
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.escalation
            .path
            .iter()
            .chain(self.escalation.rejected.iter())
            .map(|s| s.cost_usd)
            .sum()
    }
}
