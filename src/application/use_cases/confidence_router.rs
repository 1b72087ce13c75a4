//! Execute / execute-with-note / clarify decision.
//!
//! Query confidence is the minimum over all resolved parameters: one shaky
//! filter changes the meaning of the whole answer, so it is never averaged
//! away. Defaulted values always count at the configured default confidence.

use crate::domain::parameter::{ClarificationRequest, ExtractedParameter, ParamSource};
use crate::infrastructure::config::RoutingConfig;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterDecision {
    Execute {
        confidence: f32,
    },
    ExecuteWithNote {
        confidence: f32,
        notes: Vec<String>,
    },
    Clarify {
        request: ClarificationRequest,
        confidence: f32,
    },
}

/// Gate for dynamically generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicGate {
    Execute,
    ExecuteWithNote,
    Confirm,
}

#[derive(Debug, Clone)]
pub struct ConfidenceRouter {
    high_threshold: f32,
    medium_threshold: f32,
    default_confidence: f32,
}

impl ConfidenceRouter {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            high_threshold: config.high_threshold,
            medium_threshold: config.medium_threshold,
            default_confidence: config.default_confidence,
        }
    }

    pub fn high_threshold(&self) -> f32 {
        self.high_threshold
    }

    pub fn tier(&self, confidence: f32) -> ConfidenceTier {
        if confidence >= self.high_threshold {
            ConfidenceTier::High
        } else if confidence >= self.medium_threshold {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }

    fn effective(&self, param: &ExtractedParameter) -> f32 {
        match param.source {
            ParamSource::Default => self.default_confidence,
            _ => param.confidence,
        }
    }

    /// Minimum over resolved parameters; 1.0 when nothing needed resolving.
    pub fn overall_confidence(&self, resolved: &[ExtractedParameter]) -> f32 {
        resolved
            .iter()
            .map(|p| self.effective(p))
            .fold(1.0f32, f32::min)
    }

    pub fn route(
        &self,
        resolved: &[ExtractedParameter],
        pending: &[ClarificationRequest],
    ) -> RouterDecision {
        let overall = self.overall_confidence(resolved);

        // first of the least confident, so ties keep declared order
        let mut most_uncertain: Option<&ClarificationRequest> = None;
        for request in pending {
            if most_uncertain.map_or(true, |m| request.confidence < m.confidence) {
                most_uncertain = Some(request);
            }
        }
        if let Some(request) = most_uncertain {
            info!(
                "Routing: clarify '{}' ({} pending)",
                request.parameter,
                pending.len()
            );
            return RouterDecision::Clarify {
                request: request.clone(),
                confidence: overall.min(request.confidence),
            };
        }

        match self.tier(overall) {
            ConfidenceTier::High => {
                info!("Routing: execute ({:.2})", overall);
                RouterDecision::Execute {
                    confidence: overall,
                }
            }
            ConfidenceTier::Medium => {
                let notes: Vec<String> = resolved
                    .iter()
                    .filter(|p| self.effective(p) < self.high_threshold)
                    .map(|p| format!("Assuming {} for {}", p.value, p.name))
                    .collect();
                info!("Routing: execute with {} notes ({:.2})", notes.len(), overall);
                RouterDecision::ExecuteWithNote {
                    confidence: overall,
                    notes,
                }
            }
            ConfidenceTier::Low => {
                let mut weakest: Option<&ExtractedParameter> = None;
                for p in resolved {
                    if weakest.map_or(true, |w| self.effective(p) < self.effective(w)) {
                        weakest = Some(p);
                    }
                }
                // Low tier implies at least one resolved parameter.
                let request = weakest
                    .map(|p| self.confirm_request(p))
                    .unwrap_or_else(|| ClarificationRequest {
                        parameter: String::new(),
                        prompt: "Could you rephrase the question?".to_string(),
                        best_guess: None,
                        confidence: overall,
                        alternatives: Vec::new(),
                    });
                info!("Routing: clarify low-confidence '{}' ({:.2})", request.parameter, overall);
                RouterDecision::Clarify {
                    request,
                    confidence: overall,
                }
            }
        }
    }

    fn confirm_request(&self, param: &ExtractedParameter) -> ClarificationRequest {
        let guess = param.value.to_string();
        let alternatives: Vec<String> = param
            .alternatives
            .iter()
            .filter(|a| **a != guess)
            .take(3)
            .cloned()
            .collect();
        let mut prompt = format!("I'm not sure about {}. Did you mean {}?", param.name, guess);
        if !alternatives.is_empty() {
            let numbered = alternatives
                .iter()
                .enumerate()
                .map(|(i, a)| format!("{}) {}", i + 1, a))
                .collect::<Vec<_>>()
                .join(", ");
            prompt.push_str(&format!(" Other options: {}.", numbered));
        }
        ClarificationRequest {
            parameter: param.name.clone(),
            prompt,
            best_guess: Some(guess),
            confidence: self.effective(param),
            alternatives,
        }
    }

    pub fn route_dynamic(&self, confidence: f32) -> DynamicGate {
        match self.tier(confidence) {
            ConfidenceTier::High => DynamicGate::Execute,
            ConfidenceTier::Medium => DynamicGate::ExecuteWithNote,
            ConfidenceTier::Low => DynamicGate::Confirm,
        }
    }
}
