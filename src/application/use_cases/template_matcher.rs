//! Template Matcher
//!
//! Applies the acceptance policy on top of a [`TemplateSearch`] collaborator:
//! - scores outside `[0, 1]` are clamped, NaN scores dropped
//! - only candidates at or above the acceptance threshold are eligible
//! - the best eligible candidate wins; near-ties go to the template with
//!   fewer tokens, since fewer parameters means fewer chances to ask

use crate::application::use_cases::template_search::TemplateSearch;
use crate::domain::error::{AppError, Result};
use crate::domain::query_template::TemplateCandidate;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TIE_EPSILON: f32 = 1e-4;

pub struct TemplateMatcher {
    search: Arc<dyn TemplateSearch + Send + Sync>,
    acceptance_threshold: f32,
}

impl TemplateMatcher {
    pub fn new(search: Arc<dyn TemplateSearch + Send + Sync>, acceptance_threshold: f32) -> Self {
        Self {
            search,
            acceptance_threshold,
        }
    }

    pub fn acceptance_threshold(&self) -> f32 {
        self.acceptance_threshold
    }

    /// All candidates, sanitised and sorted best first.
    ///
    /// A failing LLM-backed search counts as "nothing found" so the caller
    /// can still fall back to dynamic SQL.
    pub async fn find(&self, question: &str) -> Result<Vec<TemplateCandidate>> {
        let raw = match self.search.search(question).await {
            Ok(found) => found,
            Err(AppError::LLMError(msg)) => {
                warn!("Template search unavailable: {}", msg);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut candidates: Vec<TemplateCandidate> = raw
            .into_iter()
            .filter(|c| !c.score.is_nan())
            .map(|mut c| {
                c.score = c.score.clamp(0.0, 1.0);
                c
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!("Template search returned {} candidates", candidates.len());
        Ok(candidates)
    }

    /// The single accepted candidate, if any clears the threshold.
    pub fn select(&self, candidates: &[TemplateCandidate]) -> Option<TemplateCandidate> {
        let mut eligible = candidates
            .iter()
            .filter(|c| c.score >= self.acceptance_threshold);
        let mut best = eligible.next()?;
        for candidate in eligible {
            let better = candidate.score > best.score + TIE_EPSILON;
            let tied = (candidate.score - best.score).abs() <= TIE_EPSILON;
            if better
                || (tied && candidate.template.tokens().len() < best.template.tokens().len())
            {
                best = candidate;
            }
        }
        Some(best.clone())
    }

    pub async fn best_match(&self, question: &str) -> Result<Option<TemplateCandidate>> {
        let candidates = self.find(question).await?;
        let selected = self.select(&candidates);
        match &selected {
            Some(c) => info!(
                "Selected template '{}' (score {:.2}: {})",
                c.template.id, c.score, c.reason
            ),
            None => info!(
                "No template cleared {:.2} (best {:.2})",
                self.acceptance_threshold,
                candidates.first().map(|c| c.score).unwrap_or(0.0)
            ),
        }
        Ok(selected)
    }

    /// Score the given template would get for `question`, with the best
    /// competing candidate.
    pub async fn rescore(
        &self,
        question: &str,
        template_id: &str,
    ) -> Result<(Option<f32>, Option<TemplateCandidate>)> {
        let candidates = self.find(question).await?;
        let own = candidates
            .iter()
            .find(|c| c.template.id == template_id)
            .map(|c| c.score);
        let other = candidates
            .into_iter()
            .find(|c| c.template.id != template_id);
        Ok((own, other))
    }
}
