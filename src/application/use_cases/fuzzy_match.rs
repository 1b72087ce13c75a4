//! Fuzzy mapping of free-text candidates onto a parameter's allowed values.
//!
//! Scoring:
//! - Exact (case-sensitive) match: 1.0
//! - Equal after case/plural normalisation: 1.0
//! - Equal to a declared synonym: 0.95
//! - Whole-word containment either way: 0.6 - 1.0 by length ratio
//! - Plain substring either way: 0.5 - 0.8 by length ratio
//!
//! A match is accepted only when it clears `MIN_MATCH_SCORE` and beats the
//! runner-up by at least `CLEAR_MARGIN`.

use std::collections::BTreeMap;

pub const MIN_MATCH_SCORE: f32 = 0.5;
pub const CLEAR_MARGIN: f32 = 0.15;

#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyOutcome {
    Matched { value: String, score: f32 },
    /// Several allowed values scored too close to call.
    Ambiguous { ranked: Vec<String> },
    NoMatch,
}

/// Lowercase, strip punctuation, singularise each word.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(singularize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn singularize(word: &str) -> String {
    let len = word.len();
    if len > 4 && word.ends_with("ies") {
        format!("{}y", &word[..len - 3])
    } else if len > 4
        && (word.ends_with("sses")
            || word.ends_with("xes")
            || word.ends_with("ches")
            || word.ends_with("shes"))
    {
        word[..len - 2].to_string()
    } else if len > 3
        && word.ends_with('s')
        && !word.ends_with("ss")
        && !word.ends_with("us")
        && !word.ends_with("is")
    {
        word[..len - 1].to_string()
    } else {
        word.to_string()
    }
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    let hay: Vec<&str> = haystack.split(' ').collect();
    let need: Vec<&str> = needle.split(' ').collect();
    if need.is_empty() || need.len() > hay.len() {
        return false;
    }
    hay.windows(need.len()).any(|w| w == need.as_slice())
}

/// Similarity of two already-normalised strings.
pub fn similarity(a: &str, b: &str) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let ratio = shorter.len() as f32 / longer.len() as f32;
    if contains_words(longer, shorter) {
        0.6 + 0.4 * ratio
    } else if longer.contains(shorter) {
        0.5 + 0.3 * ratio
    } else {
        0.0
    }
}

/// Every allowed value paired with its best score for `candidate`, best first.
/// Ties keep declared order.
pub fn rank_allowed(
    candidate: &str,
    allowed: &[String],
    synonyms: &BTreeMap<String, Vec<String>>,
) -> Vec<(String, f32)> {
    let cand = normalize(candidate);
    let mut scored: Vec<(String, f32)> = allowed
        .iter()
        .map(|value| {
            if value == candidate.trim() {
                return (value.clone(), 1.0);
            }
            let mut best = similarity(&cand, &normalize(value));
            if let Some(phrases) = synonyms.get(value) {
                for phrase in phrases {
                    let phrase_norm = normalize(phrase);
                    let s = if phrase_norm == cand {
                        0.95
                    } else {
                        similarity(&cand, &phrase_norm) * 0.9
                    };
                    best = best.max(s);
                }
            }
            (value.clone(), best)
        })
        .collect();

    // stable sort keeps declared order among equal scores
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

pub fn map_to_allowed(
    candidate: &str,
    allowed: &[String],
    synonyms: &BTreeMap<String, Vec<String>>,
) -> FuzzyOutcome {
    let ranked = rank_allowed(candidate, allowed, synonyms);
    let Some((best_value, best_score)) = ranked.first().cloned() else {
        return FuzzyOutcome::NoMatch;
    };

    if best_score < MIN_MATCH_SCORE {
        return FuzzyOutcome::NoMatch;
    }

    let runner_up = ranked.get(1).map(|(_, s)| *s).unwrap_or(0.0);
    if best_score < 1.0 && best_score - runner_up < CLEAR_MARGIN {
        return FuzzyOutcome::Ambiguous {
            ranked: ranked
                .into_iter()
                .filter(|(_, s)| *s >= MIN_MATCH_SCORE)
                .map(|(v, _)| v)
                .collect(),
        };
    }

    FuzzyOutcome::Matched {
        value: best_value,
        score: best_score,
    }
}
