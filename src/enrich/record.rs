//! Enrichment record: the seven cellar-card sections plus provenance.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Grape percentages may drift a little when a model rounds; beyond this
/// the whole composition is untrustworthy.
const GRAPE_SUM_TOLERANCE: f64 = 15.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grape_composition: Option<Vec<GrapeShare>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_profile: Option<StyleProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasting_notes: Option<TastingNotes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_scores: Option<Vec<CriticScore>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drink_window: Option<DrinkWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food_pairings: Option<Vec<String>>,
    /// Where this record came from: inference, cache, or web_search.
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub stale: bool,
}

fn default_source() -> String {
    "inference".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrapeShare {
    pub grape: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StyleProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tannin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acidity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweetness: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TastingNotes {
    #[serde(default)]
    pub nose: Vec<String>,
    #[serde(default)]
    pub palate: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CriticScore {
    pub critic: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vintage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrinkWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak: Option<i32>,
}

impl EnrichmentRecord {
    /// Tolerant parse of model output; unknown keys ignored, unparseable
    /// sections dropped.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(sanitize_sections(value)).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Enforce section invariants, dropping any section that fails:
    /// grape percentages sum to ≈100, drink-window years are ordered,
    /// critic scores sit in [0, 100]. Never fails the record as a whole.
    pub fn validate(&mut self) -> Vec<&'static str> {
        let mut dropped = Vec::new();

        if let Some(grapes) = &self.grape_composition {
            let sum: f64 = grapes.iter().map(|g| g.percentage).sum();
            if grapes.is_empty() || (sum - 100.0).abs() > GRAPE_SUM_TOLERANCE {
                self.grape_composition = None;
                dropped.push("grapeComposition");
            }
        }

        if let Some(w) = &self.drink_window {
            let ordered = match (w.start, w.peak, w.end) {
                (Some(s), Some(p), Some(e)) => s <= p && p <= e,
                (Some(s), None, Some(e)) => s <= e,
                (Some(s), Some(p), None) => s <= p,
                (None, Some(p), Some(e)) => p <= e,
                _ => true,
            };
            if !ordered {
                self.drink_window = None;
                dropped.push("drinkWindow");
            }
        }

        if let Some(scores) = &self.critic_scores {
            if scores.iter().any(|s| s.score < 0.0 || s.score > 100.0) {
                self.critic_scores = None;
                dropped.push("criticScores");
            }
        }

        dropped
    }

    /// Section-wise merge: `self` is the newer record and wins where it
    /// has a value; sections only the older record carries survive.
    pub fn merge_over(mut self, older: &EnrichmentRecord) -> EnrichmentRecord {
        self.overview = self.overview.or_else(|| older.overview.clone());
        self.grape_composition = self
            .grape_composition
            .or_else(|| older.grape_composition.clone());
        self.style_profile = self.style_profile.or_else(|| older.style_profile.clone());
        self.tasting_notes = self.tasting_notes.or_else(|| older.tasting_notes.clone());
        self.critic_scores = self.critic_scores.or_else(|| older.critic_scores.clone());
        self.drink_window = self.drink_window.or_else(|| older.drink_window.clone());
        self.food_pairings = self.food_pairings.or_else(|| older.food_pairings.clone());
        self
    }
}

/// Strip sections whose JSON shape is wrong before the typed parse, so
/// one malformed section cannot void the others.
fn sanitize_sections(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return Value::Object(Default::default());
    };
    let mut out = serde_json::Map::new();
    for (k, v) in map {
        let keep = match k.as_str() {
            "overview" => v.is_string(),
            "grapeComposition" | "criticScores" | "foodPairings" => v.is_array(),
            "styleProfile" | "tastingNotes" | "drinkWindow" => v.is_object(),
            "source" => v.is_string(),
            _ => false,
        };
        if keep {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}
