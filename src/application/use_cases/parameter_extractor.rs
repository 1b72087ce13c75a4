//! Parameter Extractor
//!
//! Resolves each declared parameter of a template, in declared order:
//! 1. sort-direction parameters first try the superlative rule
//!    ("top" -> DESC, "lowest" -> ASC)
//! 2. the LLM proposes a value
//! 3. list parameters map the proposal onto `allowed_values` fuzzily
//! 4. the validator has the last word; a rejection means "not inferred"
//! 5. unresolved values fall back to the default, a clarification request,
//!    or a configuration error when the template allows neither
//!
//! The LLM output is untrusted input. Only validated values leave here.

use crate::application::use_cases::clarification_session::{confirmation_reply, ConfirmationReply};
use crate::application::use_cases::fuzzy_match::{map_to_allowed, FuzzyOutcome};
use crate::application::use_cases::llm_contract::{ask_llm, scalar_to_string, LlmOutcome};
use crate::application::use_cases::parameter_validator::ParameterValidator;
use crate::application::use_cases::relative_date::resolve_relative_date;
use crate::domain::error::{AppError, Result, ValidationErrorKind};
use crate::domain::llm_config::LLMConfig;
use crate::domain::parameter::{
    clamp_confidence, ClarificationRequest, ExtractedParameter, ExtractionOutcome, ParamSource,
    ParamValue, DATE_FORMAT,
};
use crate::domain::query_template::{ParamType, ParameterSpec, QueryTemplate, SpecBound};
use crate::infrastructure::llm_clients::LLMClient;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAX_ALTERNATIVES: usize = 3;
const SUPERLATIVE_CONFIDENCE: f32 = 0.95;
const RELATIVE_DATE_CONFIDENCE: f32 = 0.7;
const UNSTATED_LLM_CONFIDENCE: f32 = 0.8;

const DESCENDING_WORDS: &[&str] = &[
    "top", "best", "highest", "most", "largest", "biggest", "greatest", "max", "maximum",
];
const ASCENDING_WORDS: &[&str] = &[
    "bottom", "worst", "lowest", "least", "smallest", "fewest", "min", "minimum",
];

/// Result of resolving one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamResolution {
    Resolved(ExtractedParameter),
    Pending(ClarificationRequest),
}

#[derive(Debug, Deserialize)]
struct InferredValue {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    alternatives: Vec<Value>,
}

/// What inference produced before fallbacks are applied.
#[derive(Debug, Default)]
struct Attempt {
    resolved: Option<(ParamValue, f32)>,
    best_guess: Option<String>,
    guess_confidence: f32,
    alternatives: Vec<String>,
}

/// Superlative rule for sort direction. `None` when the question has no
/// superlative or mixes both kinds.
pub fn superlative_direction(question: &str) -> Option<&'static str> {
    let lower = question.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let desc = words.iter().any(|w| DESCENDING_WORDS.contains(w));
    let asc = words.iter().any(|w| ASCENDING_WORDS.contains(w));
    match (desc, asc) {
        (true, false) => Some("DESC"),
        (false, true) => Some("ASC"),
        _ => None,
    }
}

fn spell_direction(spec: &ParameterSpec, direction: &str) -> String {
    spec.allowed_values
        .as_ref()
        .and_then(|allowed| allowed.iter().find(|v| v.eq_ignore_ascii_case(direction)))
        .cloned()
        .unwrap_or_else(|| direction.to_string())
}

/// Allowed values other than `exclude`, capped.
fn fallback_alternatives(spec: &ParameterSpec, exclude: Option<&str>) -> Vec<String> {
    spec.allowed_values
        .as_ref()
        .map(|allowed| {
            allowed
                .iter()
                .filter(|v| Some(v.as_str()) != exclude)
                .take(MAX_ALTERNATIVES)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn merge_alternatives(first: Vec<String>, second: Vec<String>, exclude: Option<&str>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for value in first.into_iter().chain(second) {
        if Some(value.as_str()) != exclude && !merged.contains(&value) {
            merged.push(value);
        }
        if merged.len() == MAX_ALTERNATIVES {
            break;
        }
    }
    merged
}

fn describe_bound(bound: &SpecBound) -> String {
    match bound {
        SpecBound::Integer(n) => n.to_string(),
        SpecBound::Text(s) => s.clone(),
    }
}

/// User-facing question for one parameter.
pub fn clarification_prompt(spec: &ParameterSpec, alternatives: &[String]) -> String {
    let subject = spec.description.as_deref().unwrap_or(&spec.name);
    let mut prompt = match spec.param_type {
        ParamType::Integer => match (&spec.min, &spec.max) {
            (Some(min), Some(max)) => format!(
                "How many for {}? (a whole number from {} to {})",
                subject,
                describe_bound(min),
                describe_bound(max)
            ),
            _ => format!("What number should I use for {}?", subject),
        },
        ParamType::Date => format!("Which date should I use for {}? (YYYY-MM-DD)", subject),
        ParamType::String => format!("Which {} do you mean?", subject),
    };
    if !alternatives.is_empty() {
        let numbered = alternatives
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{}) {}", i + 1, a))
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!(" Options: {}.", numbered));
    }
    prompt
}

pub fn clarification_request(
    spec: &ParameterSpec,
    best_guess: Option<String>,
    confidence: f32,
    alternatives: Vec<String>,
) -> ClarificationRequest {
    let alternatives = if alternatives.is_empty() {
        fallback_alternatives(spec, best_guess.as_deref())
    } else {
        alternatives
    };
    ClarificationRequest {
        parameter: spec.name.clone(),
        prompt: clarification_prompt(spec, &alternatives),
        best_guess,
        confidence: clamp_confidence(confidence),
        alternatives,
    }
}

pub struct ParameterExtractor {
    llm_client: Arc<dyn LLMClient + Send + Sync>,
    config: LLMConfig,
    default_confidence: f32,
}

impl ParameterExtractor {
    pub fn new(
        llm_client: Arc<dyn LLMClient + Send + Sync>,
        config: LLMConfig,
        default_confidence: f32,
    ) -> Self {
        Self {
            llm_client,
            config,
            default_confidence,
        }
    }

    pub async fn extract(
        &self,
        question: &str,
        template: &QueryTemplate,
        reference_date: NaiveDate,
    ) -> Result<ExtractionOutcome> {
        let mut outcome = ExtractionOutcome::default();
        for spec in &template.parameters {
            match self.extract_one(question, spec, reference_date).await {
                Ok(ParamResolution::Resolved(p)) => {
                    debug!(
                        "'{}' = {} ({:?}, {:.2})",
                        p.name, p.value, p.source, p.confidence
                    );
                    outcome.resolved.push(p)
                }
                Ok(ParamResolution::Pending(r)) => {
                    debug!("'{}' needs clarification (guess {:?})", r.parameter, r.best_guess);
                    outcome.pending.push(r)
                }
                Err(e) => {
                    if let AppError::Configuration(msg) = &e {
                        tracing::error!("Template '{}' is misconfigured: {}", template.id, msg);
                    }
                    return Err(e);
                }
            }
        }
        info!(
            "Extracted {} of {} parameters for '{}'",
            outcome.resolved.len(),
            template.parameters.len(),
            template.id
        );
        Ok(outcome)
    }

    pub async fn extract_one(
        &self,
        question: &str,
        spec: &ParameterSpec,
        reference_date: NaiveDate,
    ) -> Result<ParamResolution> {
        let attempt = self.infer(question, spec, reference_date).await;
        if let Some((value, confidence)) = attempt.resolved {
            let rendered = value.to_string();
            let alternatives = merge_alternatives(
                attempt.alternatives,
                fallback_alternatives(spec, None),
                Some(rendered.as_str()),
            );
            return Ok(ParamResolution::Resolved(ExtractedParameter {
                name: spec.name.clone(),
                value,
                source: ParamSource::Inferred,
                confidence,
                alternatives,
            }));
        }
        self.fallback(spec, attempt)
    }

    fn fallback(&self, spec: &ParameterSpec, attempt: Attempt) -> Result<ParamResolution> {
        if let Some(default) = &spec.default_value {
            let value = ParameterValidator::check(spec, default).map_err(|e| {
                AppError::Configuration(format!("default for '{}' is invalid: {}", spec.name, e))
            })?;
            let alternatives = merge_alternatives(
                attempt.alternatives,
                fallback_alternatives(spec, None),
                Some(default.as_str()),
            );
            return Ok(ParamResolution::Resolved(ExtractedParameter {
                name: spec.name.clone(),
                value,
                source: ParamSource::Default,
                confidence: self.default_confidence,
                alternatives,
            }));
        }

        if spec.ask_if_missing {
            return Ok(ParamResolution::Pending(clarification_request(
                spec,
                attempt.best_guess,
                attempt.guess_confidence,
                attempt.alternatives,
            )));
        }

        Err(AppError::Configuration(format!(
            "parameter '{}' could not be resolved and has neither a default nor ask_if_missing",
            spec.name
        )))
    }

    async fn infer(&self, question: &str, spec: &ParameterSpec, reference_date: NaiveDate) -> Attempt {
        let mut attempt = Attempt::default();

        if spec.is_sort_direction() {
            if let Some(direction) = superlative_direction(question) {
                let spelled = spell_direction(spec, direction);
                if let Ok(value) = ParameterValidator::check(spec, &spelled) {
                    attempt.resolved = Some((value, SUPERLATIVE_CONFIDENCE));
                    return attempt;
                }
            }
        }

        let prompt = build_extraction_prompt(question, spec, reference_date);
        let outcome: LlmOutcome<InferredValue> = ask_llm(
            self.llm_client.as_ref(),
            &self.config,
            "You extract exactly one SQL parameter value from a question. Reply with JSON only.",
            &prompt,
        )
        .await;

        let mut candidate: Option<(String, f32)> = None;
        match outcome {
            LlmOutcome::Success(body) => {
                attempt.alternatives = body
                    .alternatives
                    .iter()
                    .filter_map(scalar_to_string)
                    .take(MAX_ALTERNATIVES)
                    .collect();
                if let Some(value) = body.value.as_ref().and_then(scalar_to_string) {
                    let confidence =
                        clamp_confidence(body.confidence.unwrap_or(UNSTATED_LLM_CONFIDENCE));
                    candidate = Some((value, confidence));
                }
            }
            LlmOutcome::NeedsClarification {
                best_guess, options, ..
            } => {
                attempt.best_guess = best_guess;
                attempt.guess_confidence = 0.3;
                attempt.alternatives = options.into_iter().take(MAX_ALTERNATIVES).collect();
            }
            LlmOutcome::Error { message } => {
                debug!("No inference for '{}': {}", spec.name, message);
            }
        }

        if let Some((raw, confidence)) = candidate {
            match self.post_process(spec, &raw, reference_date) {
                Ok((value, score)) => {
                    attempt.resolved = Some((value, clamp_confidence(confidence * score)));
                    return attempt;
                }
                Err(guess) => {
                    debug!("Inferred '{}' for '{}' rejected", raw, spec.name);
                    if let Some((best, ranked)) = guess {
                        attempt.best_guess = Some(best);
                        attempt.guess_confidence = confidence * 0.5;
                        attempt.alternatives = ranked;
                    }
                }
            }
        }

        if spec.param_type == ParamType::Date {
            if let Some(date) = resolve_relative_date(question, reference_date, spec.marks_range_end()) {
                let rendered = date.format(DATE_FORMAT).to_string();
                if let Ok(value) = ParameterValidator::check(spec, &rendered) {
                    attempt.resolved = Some((value, RELATIVE_DATE_CONFIDENCE));
                }
            }
        }

        attempt
    }

    /// Fuzzy-map and validate one candidate. On failure, returns the best
    /// guess and ranked alternatives when the mapping was merely ambiguous.
    fn post_process(
        &self,
        spec: &ParameterSpec,
        raw: &str,
        reference_date: NaiveDate,
    ) -> std::result::Result<(ParamValue, f32), Option<(String, Vec<String>)>> {
        let mut candidate = raw.trim().to_string();
        let mut score = 1.0f32;

        if spec.param_type == ParamType::Date
            && NaiveDate::parse_from_str(&candidate, DATE_FORMAT).is_err()
        {
            if let Some(date) = resolve_relative_date(&candidate, reference_date, spec.marks_range_end()) {
                candidate = date.format(DATE_FORMAT).to_string();
            }
        }

        if let Some(allowed) = &spec.allowed_values {
            match map_to_allowed(&candidate, allowed, &spec.synonyms) {
                FuzzyOutcome::Matched { value, score: s } => {
                    candidate = value;
                    score = s;
                }
                FuzzyOutcome::Ambiguous { ranked } => {
                    let ranked: Vec<String> = ranked.into_iter().take(MAX_ALTERNATIVES).collect();
                    return Err(ranked.first().cloned().map(|best| (best, ranked)));
                }
                FuzzyOutcome::NoMatch => return Err(None),
            }
        }

        let validation = ParameterValidator::validate(spec, &candidate);
        match validation.normalized_value {
            Some(value) if validation.ok => Ok((value, score)),
            _ => Err(None),
        }
    }

    /// Interpret a clarification answer for exactly one parameter.
    ///
    /// A yes/no reply to a best guess accepts or rejects that guess. Otherwise
    /// tries, in order: a numbered pick from the offered alternatives, the
    /// raw text as-is, fuzzy mapping, relative dates, then the LLM scoped to
    /// this one parameter. Returns a `Validation` error when nothing fits so
    /// the same question can be asked again.
    pub async fn extract_answer(
        &self,
        answer: &str,
        spec: &ParameterSpec,
        request: &ClarificationRequest,
        reference_date: NaiveDate,
    ) -> Result<ExtractedParameter> {
        let answer = answer.trim();
        let clarified = |value: ParamValue, confidence: f32| ExtractedParameter {
            name: spec.name.clone(),
            value,
            source: ParamSource::UserClarified,
            confidence: clamp_confidence(confidence),
            alternatives: Vec::new(),
        };

        if let Some(guess) = &request.best_guess {
            match confirmation_reply(answer) {
                ConfirmationReply::Run => {
                    let value = ParameterValidator::check(spec, guess)?;
                    return Ok(clarified(value, 1.0));
                }
                ConfirmationReply::Cancel => {
                    return Err(AppError::validation(
                        ValidationErrorKind::AllowedValueError,
                        format!("Which {} did you mean instead of {}?", spec.name, guess),
                    ));
                }
                ConfirmationReply::Other => {}
            }
        }

        if spec.param_type != ParamType::Integer {
            if let Ok(pick) = answer.trim_end_matches(|c: char| c == ')' || c == '.').parse::<usize>() {
                if pick >= 1 && pick <= request.alternatives.len() {
                    let chosen = &request.alternatives[pick - 1];
                    if let Ok(value) = ParameterValidator::check(spec, chosen) {
                        return Ok(clarified(value, 1.0));
                    }
                }
            }
        }

        let direct = ParameterValidator::validate(spec, answer);
        if let (true, Some(value)) = (direct.ok, direct.normalized_value.clone()) {
            return Ok(clarified(value, 1.0));
        }

        if let Ok((value, score)) = self.post_process(spec, answer, reference_date) {
            return Ok(clarified(value, score));
        }

        if spec.is_sort_direction() {
            if let Some(direction) = superlative_direction(answer) {
                if let Ok(value) = ParameterValidator::check(spec, &spell_direction(spec, direction)) {
                    return Ok(clarified(value, SUPERLATIVE_CONFIDENCE));
                }
            }
        }

        let attempt = self.infer(answer, spec, reference_date).await;
        if let Some((value, confidence)) = attempt.resolved {
            return Ok(clarified(value, confidence));
        }

        warn!("Answer for '{}' did not validate", spec.name);
        Err(AppError::validation(
            direct.error_kind.unwrap_or(ValidationErrorKind::TypeError),
            direct
                .message
                .unwrap_or_else(|| format!("'{}' is not a valid value for '{}'", answer, spec.name)),
        ))
    }
}

fn build_extraction_prompt(question: &str, spec: &ParameterSpec, reference_date: NaiveDate) -> String {
    let mut rules = vec![format!("type: {:?}", spec.param_type).to_lowercase()];
    if let Some(description) = &spec.description {
        rules.push(format!("meaning: {}", description));
    }
    if let Some(min) = &spec.min {
        rules.push(format!("min: {}", describe_bound(min)));
    }
    if let Some(max) = &spec.max {
        rules.push(format!("max: {}", describe_bound(max)));
    }
    if let Some(allowed) = &spec.allowed_values {
        rules.push(format!("allowed values (exact spelling): {}", allowed.join(", ")));
    }
    if spec.param_type == ParamType::Date {
        rules.push(format!(
            "dates are YYYY-MM-DD; \"today\" is {}",
            reference_date.format(DATE_FORMAT)
        ));
    }

    format!(
        r#"PARAMETER: {}
RULES:
- {}

QUESTION: "{}"

Reply with ONE of:
{{"status": "success", "value": <value>, "confidence": <0.0-1.0>, "alternatives": [<other plausible values>]}}
{{"status": "needs_clarification", "question": "<what to ask>", "best_guess": <value or null>, "options": [<up to 3 values>]}}
{{"status": "error", "message": "<why the question does not state it>"}}
Do not invent a value the question does not support."#,
        spec.name,
        rules.join("\n- "),
        question
    )
}
