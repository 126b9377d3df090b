//! Prompt templates and response schemas.
//!
//! Single source of truth for the wording sent to providers. The schemas
//! here shape-match what the field detector and the services expect;
//! tests pin that contract so prompt drift breaks loudly.

use serde_json::{json, Value};

/// Schema constraining identification output. Field names here are the
/// exact names streamed to clients as `field` events.
pub fn identification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "producer":   { "type": "string", "nullable": true },
            "wineName":   { "type": "string", "nullable": true },
            "vintage":    { "type": "string", "nullable": true },
            "region":     { "type": "string", "nullable": true },
            "country":    { "type": "string", "nullable": true },
            "wineType":   { "type": "string", "enum": ["Red", "White", "Rosé", "Sparkling", "Dessert", "Fortified"], "nullable": true },
            "grapes":     { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "integer", "minimum": 0, "maximum": 100 },
            "candidates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "wineName": { "type": "string" },
                        "score":    { "type": "integer" }
                    }
                }
            }
        },
        "required": ["confidence"]
    })
}

/// Schema for the seven enrichment sections.
pub fn enrichment_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "overview": { "type": "string" },
            "grapeComposition": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "grape":      { "type": "string" },
                        "percentage": { "type": "number" }
                    }
                }
            },
            "styleProfile": {
                "type": "object",
                "properties": {
                    "body":      { "type": "string" },
                    "tannin":    { "type": "string" },
                    "acidity":   { "type": "string" },
                    "sweetness": { "type": "string" }
                }
            },
            "tastingNotes": {
                "type": "object",
                "properties": {
                    "nose":   { "type": "array", "items": { "type": "string" } },
                    "palate": { "type": "array", "items": { "type": "string" } },
                    "finish": { "type": "string" }
                }
            },
            "criticScores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "critic":  { "type": "string" },
                        "score":   { "type": "number" },
                        "vintage": { "type": "string" }
                    }
                }
            },
            "drinkWindow": {
                "type": "object",
                "properties": {
                    "start": { "type": "integer" },
                    "end":   { "type": "integer" },
                    "peak":  { "type": "integer" }
                }
            },
            "foodPairings": { "type": "array", "items": { "type": "string" } }
        }
    })
}

/// Top-level property names of a schema, for contract tests and field
/// synthesis ordering.
pub fn schema_fields(schema: &Value) -> Vec<String> {
    schema["properties"]
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

// ── Identification ────────────────────────────────────────────

/// Tier 1 streaming prompt: compact, because the response schema carries
/// the structure. Shorter prompt, faster first byte.
pub fn identify_text_compact(text: &str) -> String {
    format!(
        "You are a master sommelier. Identify the wine described below. \
         Respond with JSON only. Confidence reflects whether this is a real, \
         verifiable wine — not how many fields you filled in. Use null for \
         anything you cannot read or infer.\n\nWine: {text}"
    )
}

/// Tier 1 fallback prompt: full instructions for providers running
/// without a response schema.
pub fn identify_text_full(text: &str) -> String {
    format!(
        "You are a master sommelier identifying a wine from a user's description.\n\
         Return a single JSON object with exactly these keys: producer, wineName, \
         vintage, region, country, wineType, grapes, confidence, candidates.\n\
         - vintage is a year string or \"NV\" for non-vintage.\n\
         - wineType is one of Red, White, Rosé, Sparkling, Dessert, Fortified.\n\
         - grapes is an array of variety names.\n\
         - confidence (0-100) measures recognition of a real wine, never \
           plausibility of filled fields.\n\
         - candidates lists alternative matches as {{wineName, score}} when \
           the description is ambiguous.\n\
         Use null for unknown fields. No prose outside the JSON.\n\nWine: {text}"
    )
}

/// Tier 1.5+ prompt: detailed analysis, optionally grounded, with the
/// previous tier's context appended.
pub fn identify_text_deep(text: &str, augmentation: &str) -> String {
    let mut prompt = identify_text_full(text);
    prompt.push_str(
        "\n\nTake your time. Cross-check producer, appellation, and vintage \
         against what you know of real bottlings; if a web search tool is \
         available, verify before answering.",
    );
    if !augmentation.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(augmentation);
    }
    prompt
}

/// Tier 1 vision prompt: framed as label reading to keep the model from
/// inventing a plausible wine.
pub fn identify_image_compact(supplementary: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are a master sommelier. Read the text on this wine label and \
         identify the wine. Report only what the label supports plus safe \
         inferences (an appellation implies its country). Respond with JSON \
         only; null for anything illegible.",
    );
    if let Some(extra) = supplementary {
        prompt.push_str("\nThe user adds: ");
        prompt.push_str(extra);
    }
    prompt
}

/// Tier 1 vision fallback prompt: full instructions for buffered runs,
/// still framed as label reading.
pub fn identify_image_full(supplementary: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are a master sommelier identifying a wine from a label photograph.\n\
         Read the text on the label and report only what it supports plus safe \
         inferences (an appellation implies its country).\n\
         Return a single JSON object with exactly these keys: producer, wineName, \
         vintage, region, country, wineType, grapes, confidence, candidates.\n\
         - vintage is a year string or \"NV\" for non-vintage.\n\
         - wineType is one of Red, White, Rosé, Sparkling, Dessert, Fortified.\n\
         - grapes is an array of variety names.\n\
         - confidence (0-100) measures recognition of a real wine, never \
           plausibility of filled fields.\n\
         - candidates lists alternative matches as {wineName, score} when \
           the label is ambiguous.\n\
         Use null for anything illegible. No prose outside the JSON.",
    );
    if let Some(extra) = supplementary {
        prompt.push_str("\nThe user adds: ");
        prompt.push_str(extra);
    }
    prompt
}

pub fn identify_image_deep(supplementary: Option<&str>, augmentation: &str) -> String {
    let mut prompt = identify_image_compact(supplementary);
    prompt.push_str(
        "\n\nExamine the label again carefully — embossing, small print, \
         alcohol percentage, bottler marks. Verify the producer and cuvée \
         exist; use web search if available.",
    );
    if !augmentation.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(augmentation);
    }
    prompt
}

// ── Enrichment ────────────────────────────────────────────────

pub fn enrich(producer: &str, wine_name: &str, vintage: Option<&str>) -> String {
    let vintage_part = vintage
        .map(|v| format!(" {v}"))
        .unwrap_or_default();
    format!(
        "You are a master sommelier writing a cellar card for: {producer} \
         {wine_name}{vintage_part}.\n\
         Return a single JSON object with keys: overview, grapeComposition, \
         styleProfile, tastingNotes, criticScores, drinkWindow, foodPairings.\n\
         - grapeComposition percentages must sum to roughly 100.\n\
         - drinkWindow years must satisfy start <= peak <= end.\n\
         - criticScores on a 0-100 scale, with the critic's name.\n\
         Omit any section you cannot source confidently. Emit styleProfile \
         early. No prose outside the JSON."
    )
}

// ── Clarification ─────────────────────────────────────────────

pub fn clarify_match(kind: &str, identified: &str, options: &[String]) -> String {
    let list = options
        .iter()
        .enumerate()
        .map(|(i, o)| format!("{}. {o}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "A wine {kind} was identified as \"{identified}\" but several known \
         values are close. Pick the best match from the numbered options, or \
         \"none\" if no option fits.\n{list}\n\
         Respond with JSON: {{\"choice\": <number or null>, \"reason\": \"...\"}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identification_schema_field_contract() {
        let fields = schema_fields(&identification_schema());
        for expected in [
            "producer",
            "wineName",
            "vintage",
            "region",
            "country",
            "wineType",
            "grapes",
            "confidence",
            "candidates",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_enrichment_schema_has_seven_sections() {
        let fields = schema_fields(&enrichment_schema());
        assert_eq!(fields.len(), 7);
        assert!(fields.iter().any(|f| f == "drinkWindow"));
        assert!(fields.iter().any(|f| f == "grapeComposition"));
    }

    #[test]
    fn test_compact_prompt_is_shorter_than_full() {
        let compact = identify_text_compact("Ch. Margaux 2019");
        let full = identify_text_full("Ch. Margaux 2019");
        assert!(compact.len() < full.len());
    }

    #[test]
    fn test_deep_prompt_carries_augmentation() {
        let p = identify_text_deep("Cloudy Bay", "Previous attempt: Producer=Cloudy Bay");
        assert!(p.contains("Previous attempt"));
    }

    #[test]
    fn test_image_prompt_mentions_label_reading() {
        let p = identify_image_compact(None);
        assert!(p.contains("label"));
        let p = identify_image_compact(Some("bought in Beaune"));
        assert!(p.contains("bought in Beaune"));
    }

    #[test]
    fn test_image_compact_prompt_is_shorter_than_full() {
        let compact = identify_image_compact(None);
        let full = identify_image_full(None);
        assert!(compact.len() < full.len());
        // The fallback prompt spells out the key contract the schema
        // would otherwise carry
        assert!(full.contains("producer, wineName"));
        assert!(full.contains("candidates"));
    }

    #[test]
    fn test_image_full_carries_supplementary_text() {
        let p = identify_image_full(Some("bought in Beaune"));
        assert!(p.contains("bought in Beaune"));
    }

    #[test]
    fn test_clarify_numbers_options() {
        let p = clarify_match(
            "producer",
            "Penfolds",
            &["Penfolds".to_string(), "Penley Estate".to_string()],
        );
        assert!(p.contains("1. Penfolds"));
        assert!(p.contains("2. Penley Estate"));
    }
}
