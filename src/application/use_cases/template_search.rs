//! Template search collaborators.
//!
//! Both implementations score every catalog template against a question and
//! return candidates with a similarity in `[0, 1]`. Acceptance policy lives
//! in the template matcher, not here.

use crate::application::use_cases::fuzzy_match::normalize;
use crate::application::use_cases::llm_contract::{ask_llm, LlmOutcome};
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::LLMConfig;
use crate::domain::parameter::clamp_confidence;
use crate::domain::query_template::{QueryTemplate, TemplateCandidate};
use crate::infrastructure::catalog::TemplateCatalog;
use crate::infrastructure::llm_clients::LLMClient;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait TemplateSearch {
    async fn search(&self, question: &str) -> Result<Vec<TemplateCandidate>>;
}

/// Lexical scoring over intent keywords and table mentions. No network.
pub struct KeywordTemplateSearch {
    catalog: Arc<TemplateCatalog>,
}

impl KeywordTemplateSearch {
    pub fn new(catalog: Arc<TemplateCatalog>) -> Self {
        Self { catalog }
    }

    /// Returns (score, reason).
    ///
    /// Keywords carry the score: the best single keyword is worth 80%,
    /// the share of keywords that hit another 20%. Mentioning the template's
    /// tables adds a small bonus.
    pub fn score_template(question: &str, template: &QueryTemplate) -> (f32, String) {
        let question_norm = normalize(question);
        let question_words: HashSet<&str> = question_norm.split_whitespace().collect();

        let keyword_scores: Vec<f32> = template
            .intent_keywords
            .iter()
            .map(|k| Self::score_keyword(&question_norm, &question_words, k))
            .collect();
        if keyword_scores.is_empty() {
            return (0.0, "no intent keywords".to_string());
        }

        let best = keyword_scores.iter().cloned().fold(0.0f32, f32::max);
        let coverage = keyword_scores.iter().filter(|s| **s >= 0.75).count() as f32
            / keyword_scores.len() as f32;
        let table_score = Self::score_tables(&question_words, template);

        let score = (best * 0.8 + coverage * 0.2 + table_score * 0.1).min(1.0);
        let reason = format!(
            "keyword: {:.2}, coverage: {:.2}, tables: {:.2}",
            best, coverage, table_score
        );
        (score, reason)
    }

    /// Exact phrase 1.0, all words in any order 0.75, partial up to 0.25.
    fn score_keyword(question_norm: &str, question_words: &HashSet<&str>, keyword: &str) -> f32 {
        let keyword_norm = normalize(keyword);
        let keyword_words: Vec<&str> = keyword_norm.split_whitespace().collect();
        if keyword_words.is_empty() {
            return 0.0;
        }

        let padded_question = format!(" {} ", question_norm);
        if padded_question.contains(&format!(" {} ", keyword_norm)) {
            return 1.0;
        }
        if keyword_words.len() == 1 {
            return 0.0;
        }

        let present = keyword_words
            .iter()
            .filter(|w| question_words.contains(*w))
            .count();
        if present == keyword_words.len() {
            0.75
        } else {
            (present as f32 / keyword_words.len() as f32) * 0.25
        }
    }

    fn score_tables(question_words: &HashSet<&str>, template: &QueryTemplate) -> f32 {
        if template.tables_used.is_empty() {
            return 0.0;
        }
        let hits = template
            .tables_used
            .iter()
            .filter(|t| {
                let bare = t.rsplit('.').next().unwrap_or(t.as_str());
                normalize(bare)
                    .split_whitespace()
                    .all(|w| question_words.contains(w))
            })
            .count();
        hits as f32 / template.tables_used.len() as f32
    }
}

#[async_trait]
impl TemplateSearch for KeywordTemplateSearch {
    async fn search(&self, question: &str) -> Result<Vec<TemplateCandidate>> {
        let mut candidates: Vec<TemplateCandidate> = self
            .catalog
            .templates()
            .iter()
            .map(|template| {
                let (score, reason) = Self::score_template(question, template);
                TemplateCandidate {
                    template: template.clone(),
                    score,
                    reason,
                }
            })
            .filter(|c| c.score > 0.0)
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }
}

/// Asks the model to rate intent similarity, so paraphrases and other
/// languages still find their template.
pub struct LlmTemplateSearch {
    llm_client: Arc<dyn LLMClient + Send + Sync>,
    config: LLMConfig,
    catalog: Arc<TemplateCatalog>,
}

#[derive(Debug, Deserialize)]
struct MatchesBody {
    #[serde(default)]
    matches: Vec<LlmMatch>,
}

#[derive(Debug, Deserialize)]
struct LlmMatch {
    template_id: String,
    score: f32,
    #[serde(default)]
    reasoning: String,
}

impl LlmTemplateSearch {
    const BATCH_SIZE: usize = 10;
    const STOP_SCORE: f32 = 0.9;

    pub fn new(
        llm_client: Arc<dyn LLMClient + Send + Sync>,
        config: LLMConfig,
        catalog: Arc<TemplateCatalog>,
    ) -> Self {
        Self {
            llm_client,
            config,
            catalog,
        }
    }

    fn build_prompt(question: &str, batch: &[Arc<QueryTemplate>]) -> String {
        let list = batch
            .iter()
            .map(|t| {
                format!(
                    "- id: \"{}\"\n  name: {}\n  description: {}\n  example: {}",
                    t.id,
                    t.name,
                    t.description.as_deref().unwrap_or("-"),
                    t.example_question.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Rate how well each query template answers the user's question, by INTENT rather than wording.

QUESTION: "{}"

TEMPLATES:
{}

Respond with JSON only:
{{"status": "success", "matches": [{{"template_id": "<id>", "score": <0.0-1.0>, "reasoning": "<short>"}}]}}
If no template fits, return an empty "matches" list."#,
            question, list
        )
    }

    fn collect(body: MatchesBody, batch: &[Arc<QueryTemplate>]) -> Vec<TemplateCandidate> {
        body.matches
            .into_iter()
            .filter(|m| !m.score.is_nan())
            .filter_map(|m| {
                let template = batch.iter().find(|t| t.id == m.template_id)?;
                Some(TemplateCandidate {
                    template: template.clone(),
                    score: clamp_confidence(m.score),
                    reason: m.reasoning,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TemplateSearch for LlmTemplateSearch {
    async fn search(&self, question: &str) -> Result<Vec<TemplateCandidate>> {
        let mut candidates: Vec<TemplateCandidate> = Vec::new();

        for batch in self.catalog.templates().chunks(Self::BATCH_SIZE) {
            let prompt = Self::build_prompt(question, batch);
            let outcome: LlmOutcome<MatchesBody> = ask_llm(
                self.llm_client.as_ref(),
                &self.config,
                "You match questions to SQL query templates. Reply with JSON only.",
                &prompt,
            )
            .await;

            match outcome {
                LlmOutcome::Success(body) => candidates.extend(Self::collect(body, batch)),
                LlmOutcome::NeedsClarification { .. } => {
                    debug!("Template search asked for clarification; treating batch as no match")
                }
                LlmOutcome::Error { message } => {
                    return Err(AppError::LLMError(format!("Template search failed: {}", message)))
                }
            }

            if candidates.iter().any(|c| c.score >= Self::STOP_SCORE) {
                break;
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }
}
