use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opening delimiter of a template token, e.g. `%{{top_n}}%`.
pub const TOKEN_OPEN: &str = "%{{";
pub const TOKEN_CLOSE: &str = "}}%";

pub static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}%").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Integer,
    String,
    Date,
}

/// A `min`/`max` bound as written in the template file. Integers are plain
/// numbers, dates are `YYYY-MM-DD` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecBound {
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min: Option<SpecBound>,
    #[serde(default)]
    pub max: Option<SpecBound>,
    /// Case-sensitive, ordered.
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
    /// Allowed value -> phrases users say for it.
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub ask_if_missing: bool,
}

impl ParameterSpec {
    /// Sort-direction parameters get the superlative rule before fuzzy matching.
    pub fn is_sort_direction(&self) -> bool {
        if let Some(allowed) = &self.allowed_values {
            if !allowed.is_empty()
                && allowed
                    .iter()
                    .all(|v| v.eq_ignore_ascii_case("ASC") || v.eq_ignore_ascii_case("DESC"))
            {
                return true;
            }
        }
        let name = self.name.to_lowercase();
        self.param_type == ParamType::String
            && (name == "order"
                || name.ends_with("_order")
                || name.contains("direction")
                || name.contains("sort_dir"))
    }

    /// Date parameters named like `end_date`, `date_to` or `until` close a range.
    pub fn marks_range_end(&self) -> bool {
        let name = self.name.to_lowercase();
        name.split('_')
            .any(|part| matches!(part, "end" | "to" | "until" | "through"))
    }

    /// An unresolved value for such a parameter means the template itself is broken.
    pub fn is_misconfigured_when_unresolved(&self) -> bool {
        self.default_value.is_none() && !self.ask_if_missing
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub example_question: Option<String>,
    #[serde(default)]
    pub intent_keywords: Vec<String>,
    #[serde(default)]
    pub tables_used: Vec<String>,
    pub sql: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl QueryTemplate {
    /// Distinct token names in order of first appearance.
    pub fn tokens(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for cap in TOKEN_PATTERN.captures_iter(&self.sql) {
            let name = cap[1].to_string();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// A template returned by the search collaborator with its per-request score.
#[derive(Debug, Clone)]
pub struct TemplateCandidate {
    pub template: Arc<QueryTemplate>,
    pub score: f32,
    pub reason: String,
}
