//! Augmentation context carried between escalation tiers.
//!
//! Bundles the previous tier's parsed result, user-confirmed locked
//! fields, and structured constraints parsed out of a free-text
//! clarification. Rendered into the next tier's prompt and re-applied to
//! its parsed output so no tier can overwrite a confirmed value.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::result::WineIdentification;

static COUNTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)country\s+(?:must\s+be|is)[:\s]+([A-Za-zÀ-ÿ' -]+)").unwrap()
});
static VINTAGE_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)vintage\s+(?:range|between)[:\s]+(\d{4})\s*(?:-|–|to|and)\s*(\d{4})").unwrap()
});

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Country(String),
    VintageRange(u16, u16),
}

impl Constraint {
    fn render(&self) -> String {
        match self {
            Constraint::Country(c) => format!("Country must be: {c}"),
            Constraint::VintageRange(a, b) => format!("Vintage range: {a}-{b}"),
        }
    }
}

/// Pull structured constraints out of a free-text clarification.
/// Anything unmatched stays as prose context.
pub fn parse_constraints(text: &str) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    if let Some(caps) = COUNTRY_RE.captures(text) {
        constraints.push(Constraint::Country(caps[1].trim().to_string()));
    }
    if let Some(caps) = VINTAGE_RANGE_RE.captures(text) {
        let a: u16 = caps[1].parse().unwrap_or(0);
        let b: u16 = caps[2].parse().unwrap_or(0);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        constraints.push(Constraint::VintageRange(lo, hi));
    }
    constraints
}

#[derive(Debug, Clone, Default)]
pub struct AugmentationContext {
    pub prior: Option<WineIdentification>,
    /// User-confirmed values the next tier must preserve unchanged.
    pub locked_fields: BTreeMap<String, Value>,
    pub constraints: Vec<Constraint>,
    /// Free-text clarification, carried verbatim alongside whatever was
    /// parsed out of it.
    pub clarification: Option<String>,
}

impl AugmentationContext {
    pub fn from_prior(prior: WineIdentification) -> Self {
        Self {
            prior: Some(prior),
            ..Default::default()
        }
    }

    pub fn with_locked(mut self, locked: BTreeMap<String, Value>) -> Self {
        self.locked_fields = locked;
        self
    }

    pub fn with_clarification(mut self, text: &str) -> Self {
        self.constraints = parse_constraints(text);
        self.clarification = Some(text.to_string());
        self
    }

    /// Prompt fragment appended to the next tier's prompt.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();

        if let Some(prior) = &self.prior {
            let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "?".into());
            parts.push(format!(
                "Previous attempt: Producer={}, Wine={}, Region={} (confidence: {}%). \
                 Analyze more carefully and look for details missed.",
                field(&prior.producer),
                field(&prior.wine_name),
                field(&prior.region),
                prior.confidence
            ));
        }

        if !self.locked_fields.is_empty() {
            let locked = self
                .locked_fields
                .iter()
                .map(|(k, v)| format!("{k}={}", render_value(v)))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "The user has confirmed these values; keep them exactly as given: {locked}."
            ));
        }

        for c in &self.constraints {
            parts.push(c.render());
        }

        if let Some(text) = &self.clarification {
            if self.constraints.is_empty() {
                parts.push(format!("The user adds: {text}"));
            }
        }

        parts.join("\n")
    }

    /// Re-apply locked fields on top of a tier's parsed output. Returns
    /// the fields whose model value was actually overridden, tagged for
    /// the analytics `inferencesApplied` column.
    pub fn apply_locked(&self, wine: &mut WineIdentification) -> Vec<String> {
        let mut overridden = Vec::new();
        for (key, value) in &self.locked_fields {
            let text = value.as_str().map(str::to_string);
            let slot = match key.as_str() {
                "producer" => &mut wine.producer,
                "wineName" => &mut wine.wine_name,
                "vintage" => &mut wine.vintage,
                "region" => &mut wine.region,
                "country" => &mut wine.country,
                "wineType" => &mut wine.wine_type,
                _ => continue,
            };
            if *slot != text {
                *slot = text;
                overridden.push(format!("locked:{key}"));
            }
        }
        overridden
    }
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
