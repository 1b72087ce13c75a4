use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed format for date parameters, their bounds and their SQL rendering.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Integer(i64),
    String(String),
    Date(NaiveDate),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(n) => write!(f, "{}", n),
            ParamValue::String(s) => write!(f, "{}", s),
            ParamValue::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    Inferred,
    Default,
    UserClarified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedParameter {
    pub name: String,
    pub value: ParamValue,
    pub source: ParamSource,
    /// In [0.0, 1.0].
    pub confidence: f32,
    /// Other plausible values, used if the router decides to ask anyway.
    #[serde(default)]
    pub alternatives: Vec<String>,
}

/// One question to the user about one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub parameter: String,
    pub prompt: String,
    pub best_guess: Option<String>,
    pub confidence: f32,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub resolved: Vec<ExtractedParameter>,
    pub pending: Vec<ClarificationRequest>,
}

impl ExtractionOutcome {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
