//! Canonical keys and fuzzy name resolution for the enrichment cache.
//!
//! Keys are case-, diacritic-, and whitespace-folded, so "Château
//! Margaux" and "chateau  MARGAUX" address the same row. Near misses
//! (typos, transpositions) are resolved by edit distance against rows of
//! the same vintage; the resolver is a pure function over candidate rows
//! handed to it, never a cache owner.

use crate::config::FuzzyThresholds;
use crate::store::EnrichmentRow;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub producer: String,
    pub wine_name: String,
    pub vintage: String,
}

/// Fold one string into canonical form: diacritics stripped, lowercased,
/// trimmed, inner whitespace collapsed.
pub fn canonical(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = true; // leading whitespace is dropped
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        match fold_char(c) {
            Some(mapped) => out.push_str(mapped),
            None => out.extend(c.to_lowercase()),
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

pub fn canonical_key(producer: &str, wine_name: &str, vintage: Option<&str>) -> CanonicalKey {
    let vintage = vintage
        .map(canonical)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "nv".to_string());
    CanonicalKey {
        producer: canonical(producer),
        wine_name: canonical(wine_name),
        vintage,
    }
}

/// Strip the diacritic from one char. Covers the Latin ranges that occur
/// on wine labels; anything unmapped passes through untouched.
fn fold_char(c: char) -> Option<&'static str> {
    let mapped = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ç' | 'Ç' => "c",
        'ñ' | 'Ñ' => "n",
        'œ' | 'Œ' => "oe",
        'æ' | 'Æ' => "ae",
        'ß' => "ss",
        _ => return None,
    };
    Some(mapped)
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// A fuzzy proposal: the nearest row plus a [0, 1] confidence.
#[derive(Debug, Clone)]
pub struct FuzzyProposal<'a> {
    pub row: &'a EnrichmentRow,
    pub confidence: f64,
}

/// Find the single best near match among candidate rows (same vintage,
/// pre-filtered by the caller). Producer and wine name must each be
/// within their configured edit-distance thresholds.
pub fn resolve<'a>(
    rows: &'a [EnrichmentRow],
    key: &CanonicalKey,
    thresholds: &FuzzyThresholds,
) -> Option<FuzzyProposal<'a>> {
    let mut best: Option<(usize, &EnrichmentRow)> = None;

    for row in rows {
        if row.canonical_vintage != key.vintage {
            continue;
        }
        let dp = edit_distance(&row.canonical_producer, &key.producer);
        if dp > thresholds.producer {
            continue;
        }
        let dw = edit_distance(&row.canonical_wine_name, &key.wine_name);
        if dw > thresholds.wine {
            continue;
        }
        let total = dp + dw;
        match best {
            Some((bt, _)) if bt <= total => {}
            _ => best = Some((total, row)),
        }
    }

    best.map(|(total, row)| {
        let span = (key.producer.chars().count() + key.wine_name.chars().count()).max(1);
        let confidence = 1.0 - (total as f64 / span as f64);
        FuzzyProposal {
            row,
            confidence: (confidence * 100.0).round() / 100.0,
        }
    })
}
