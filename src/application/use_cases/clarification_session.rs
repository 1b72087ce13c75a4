//! Clarification session state machine.
//!
//! `Collecting` loops one answered question per turn until every parameter
//! is resolved (`Resolved`) or the user changes topic or runs out of turns
//! (`Abandoned`). The session is plain data so any store can persist it.

use crate::domain::error::AppError;
use crate::domain::parameter::{
    ClarificationRequest, ExtractedParameter, ExtractionOutcome, ParamSource,
};
use crate::domain::query_template::QueryTemplate;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONFIRM_WORDS: &[&str] = &[
    "yes", "y", "yep", "yeah", "run", "run it", "ok", "okay", "sure", "confirm", "correct",
    "right", "go ahead", "do it",
];
const CANCEL_WORDS: &[&str] = &["no", "n", "cancel", "stop", "abort", "don't", "dont", "never mind"];

/// How a yes/no style reply reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationReply {
    Run,
    Cancel,
    Other,
}

pub fn confirmation_reply(answer: &str) -> ConfirmationReply {
    let normalized = answer
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .to_lowercase();
    if CONFIRM_WORDS.contains(&normalized.as_str()) {
        ConfirmationReply::Run
    } else if CANCEL_WORDS.contains(&normalized.as_str()) {
        ConfirmationReply::Cancel
    } else {
        ConfirmationReply::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Collecting,
    Resolved,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub id: Uuid,
    pub template: QueryTemplate,
    pub original_question: String,
    pub reference_date: NaiveDate,
    pub resolved: Vec<ExtractedParameter>,
    /// Requests not asked yet.
    pub pending: Vec<ClarificationRequest>,
    /// The single question currently waiting for an answer.
    pub outstanding: Option<ClarificationRequest>,
    pub turns: u32,
    pub max_turns: u32,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

impl ClarificationSession {
    pub fn new(
        template: QueryTemplate,
        original_question: impl Into<String>,
        reference_date: NaiveDate,
        outcome: ExtractionOutcome,
        max_turns: u32,
    ) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            template,
            original_question: original_question.into(),
            reference_date,
            resolved: outcome.resolved,
            pending: outcome.pending,
            outstanding: None,
            turns: 0,
            max_turns,
            state: SessionState::Collecting,
            created_at: Utc::now(),
        };
        info!(
            "Session {} opened for template '{}'",
            session.id, session.template.id
        );
        session
    }

    /// Make `request` the outstanding question. It leaves the pending queue.
    pub fn ask(&mut self, request: ClarificationRequest) {
        self.pending.retain(|r| r.parameter != request.parameter);
        debug!("Session {} asks for '{}'", self.id, request.parameter);
        self.outstanding = Some(request);
    }

    /// Count one user answer.
    pub fn record_turn(&mut self) {
        self.turns += 1;
    }

    pub fn has_budget(&self) -> bool {
        self.turns < self.max_turns
    }

    pub fn is_answered(&self, parameter: &str) -> bool {
        self.resolved.iter().any(|p| p.name == parameter)
    }

    /// Merge a newly resolved value. A validated user answer is an
    /// observation, so its confidence is raised to at least `floor`.
    pub fn merge(&mut self, mut param: ExtractedParameter, floor: f32) {
        if param.source == ParamSource::UserClarified {
            param.confidence = param.confidence.max(floor);
        }
        self.pending.retain(|r| r.parameter != param.name);
        if self
            .outstanding
            .as_ref()
            .map_or(false, |r| r.parameter == param.name)
        {
            self.outstanding = None;
        }
        match self.resolved.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.resolved.push(param),
        }
    }

    /// Resolved values in the template's declared parameter order.
    pub fn resolved_in_order(&self) -> Vec<ExtractedParameter> {
        self.template
            .parameters
            .iter()
            .filter_map(|spec| self.resolved.iter().find(|p| p.name == spec.name).cloned())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_none() && self.pending.is_empty()
    }

    pub fn mark_resolved(&mut self) {
        self.state = SessionState::Resolved;
        info!("Session {} resolved after {} turns", self.id, self.turns);
    }

    pub fn abandon(&mut self, reason: &str) {
        self.state = SessionState::Abandoned;
        info!("Session {} abandoned: {}", self.id, reason);
    }

    /// Abandon for running out of turns and produce the terminal error.
    pub fn exhaust(&mut self) -> AppError {
        self.abandon("turn budget exhausted");
        warn!(
            "Session {} for '{}' gave up after {} turns",
            self.id, self.template.id, self.turns
        );
        AppError::ClarificationExhausted(format!(
            "no answer for '{}' after {} clarification turns",
            self.outstanding
                .as_ref()
                .map(|r| r.parameter.as_str())
                .unwrap_or("query"),
            self.turns
        ))
    }

    /// A reply starts a new topic when another template clears acceptance
    /// and this session's template no longer holds within `margin`.
    pub fn is_topic_change(
        own_score: Option<f32>,
        best_other: Option<f32>,
        acceptance_threshold: f32,
        margin: f32,
    ) -> bool {
        match best_other {
            Some(other) if other >= acceptance_threshold => {
                own_score.map_or(true, |own| own + margin < other)
            }
            _ => false,
        }
    }
}
