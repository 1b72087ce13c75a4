//! One pass of question -> SQL -> rows per user turn.
//!
//! Fresh questions go through template matching. A matched template has its
//! parameters extracted and routed by confidence; anything that needs the
//! user is parked in the session store under a new session id. Questions no
//! template covers fall back to generated SQL, which is gated by the same
//! router and may be parked as a confirmation card instead.
//!
//! Every statement passes `QueryValidator` right before execution,
//! whichever path produced it.

use crate::application::use_cases::clarification_session::{
    confirmation_reply, ClarificationSession, ConfirmationReply,
};
use crate::application::use_cases::confidence_router::{
    ConfidenceRouter, DynamicGate, RouterDecision,
};
use crate::application::use_cases::dynamic_query_builder::{DynamicBuild, DynamicQueryBuilder};
use crate::application::use_cases::parameter_extractor::ParameterExtractor;
use crate::application::use_cases::query_validator::QueryValidator;
use crate::application::use_cases::schema_search::SchemaSearch;
use crate::application::use_cases::template_matcher::TemplateMatcher;
use crate::application::use_cases::template_sql::resolve_template;
use crate::domain::error::{AppError, ExecutionErrorKind, Result, ValidationErrorKind};
use crate::domain::parameter::{ClarificationRequest, ExtractedParameter};
use crate::domain::query_template::{QueryTemplate, TemplateCandidate};
use crate::domain::resolved_query::{
    ConfirmationCard, QueryResponse, QuerySource, ResolvedQuery,
};
use crate::infrastructure::config::RoutingConfig;
use crate::infrastructure::db::SqlExecutor;
use crate::infrastructure::session_store::{PendingConfirmation, SessionRecord, SessionStore};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

pub const MAX_QUESTION_CHARS: u64 = 4000;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
            reference_date: None,
        }
    }

    pub fn in_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn on(mut self, reference_date: NaiveDate) -> Self {
        self.reference_date = Some(reference_date);
        self
    }
}

/// Everything the pipeline talks to. Catalog-backed pieces are immutable
/// snapshots; the executor and session store are the only stateful ones.
pub struct PipelineComponents {
    pub matcher: TemplateMatcher,
    pub extractor: ParameterExtractor,
    pub dynamic_builder: DynamicQueryBuilder,
    pub schema_search: Arc<dyn SchemaSearch + Send + Sync>,
    pub validator: QueryValidator,
    pub executor: Arc<dyn SqlExecutor + Send + Sync>,
    pub sessions: Arc<dyn SessionStore + Send + Sync>,
}

pub struct QueryPipeline {
    matcher: TemplateMatcher,
    extractor: ParameterExtractor,
    dynamic_builder: DynamicQueryBuilder,
    schema_search: Arc<dyn SchemaSearch + Send + Sync>,
    validator: QueryValidator,
    executor: Arc<dyn SqlExecutor + Send + Sync>,
    sessions: Arc<dyn SessionStore + Send + Sync>,
    router: ConfidenceRouter,
    routing: RoutingConfig,
    reference_date: Option<NaiveDate>,
}

impl QueryPipeline {
    pub fn new(
        components: PipelineComponents,
        routing: &RoutingConfig,
        reference_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            matcher: components.matcher,
            extractor: components.extractor,
            dynamic_builder: components.dynamic_builder,
            schema_search: components.schema_search,
            validator: components.validator,
            executor: components.executor,
            sessions: components.sessions,
            router: ConfidenceRouter::new(routing),
            routing: routing.clone(),
            reference_date,
        }
    }

    pub async fn handle(&self, request: QueryRequest) -> Result<QueryResponse> {
        request.validate().map_err(|e| {
            AppError::validation(
                ValidationErrorKind::RangeError,
                format!("question must be 1 to {} characters: {}", MAX_QUESTION_CHARS, e),
            )
        })?;
        let question = request.question.trim();
        if question.is_empty() {
            return Err(AppError::validation(
                ValidationErrorKind::RangeError,
                "question must not be blank",
            ));
        }

        if let Some(session_id) = request.session_id {
            match self.sessions.load(session_id).await? {
                Some(SessionRecord::Clarification(session)) => {
                    if let Some(response) = self.continue_clarification(session, question).await? {
                        return Ok(response);
                    }
                }
                Some(SessionRecord::Confirmation(pending)) => {
                    if let Some(response) =
                        self.continue_confirmation(session_id, pending, question).await?
                    {
                        return Ok(response);
                    }
                }
                None => warn!("Session {} not found, treating as a new question", session_id),
            }
        }

        let reference_date = self.reference_date_for(request.reference_date);
        self.answer_fresh(question, reference_date).await
    }

    /// Request date, then configured date, then the wall clock.
    fn reference_date_for(&self, requested: Option<NaiveDate>) -> NaiveDate {
        requested.or(self.reference_date).unwrap_or_else(|| {
            let today = Utc::now().date_naive();
            warn!("No reference date configured, using today ({})", today);
            today
        })
    }

    async fn answer_fresh(&self, question: &str, reference_date: NaiveDate) -> Result<QueryResponse> {
        match self.matcher.best_match(question).await? {
            Some(candidate) => self.template_path(candidate, question, reference_date).await,
            None => self.dynamic_path(question).await,
        }
    }

    async fn template_path(
        &self,
        candidate: TemplateCandidate,
        question: &str,
        reference_date: NaiveDate,
    ) -> Result<QueryResponse> {
        let template = candidate.template;
        let outcome = self
            .extractor
            .extract(question, &template, reference_date)
            .await?;

        match self.router.route(&outcome.resolved, &outcome.pending) {
            RouterDecision::Clarify {
                request,
                confidence,
            } => {
                let mut session = ClarificationSession::new(
                    (*template).clone(),
                    question,
                    reference_date,
                    outcome,
                    self.routing.max_clarification_turns,
                );
                session.ask(request.clone());
                let id = session.id;
                self.sessions
                    .save(id, SessionRecord::Clarification(session))
                    .await?;
                Ok(QueryResponse::clarification(request, confidence, id))
            }
            RouterDecision::Execute { confidence } => {
                self.run_template(&template, &outcome.resolved, confidence, Vec::new(), question)
                    .await
            }
            RouterDecision::ExecuteWithNote { confidence, notes } => {
                self.run_template(&template, &outcome.resolved, confidence, notes, question)
                    .await
            }
        }
    }

    /// Feed one answer into a parked session. `None` means the user moved on
    /// and the text should be handled as a new question.
    async fn continue_clarification(
        &self,
        mut session: ClarificationSession,
        answer: &str,
    ) -> Result<Option<QueryResponse>> {
        let request = match session.outstanding.clone() {
            Some(request) => request,
            None => {
                warn!("Session {} had no outstanding question", session.id);
                self.sessions.discard(session.id).await?;
                return Ok(None);
            }
        };

        let (own, other) = self.matcher.rescore(answer, &session.template.id).await?;
        if ClarificationSession::is_topic_change(
            own,
            other.as_ref().map(|c| c.score),
            self.matcher.acceptance_threshold(),
            self.routing.topic_change_margin,
        ) {
            session.abandon("topic changed");
            self.sessions.discard(session.id).await?;
            return Ok(None);
        }

        session.record_turn();
        let spec = match session.template.parameter(&request.parameter) {
            Some(spec) => spec.clone(),
            None => {
                self.sessions.discard(session.id).await?;
                error!(
                    "Template '{}' has no parameter '{}'",
                    session.template.id, request.parameter
                );
                return Err(AppError::Configuration(format!(
                    "parameter '{}' is not declared by template '{}'",
                    request.parameter, session.template.id
                )));
            }
        };

        match self
            .extractor
            .extract_answer(answer, &spec, &request, session.reference_date)
            .await
        {
            Ok(param) => session.merge(param, self.router.high_threshold()),
            Err(AppError::Validation { kind, message }) => {
                info!(
                    "Session {}: answer for '{}' rejected ({})",
                    session.id, request.parameter, kind
                );
                if !session.has_budget() {
                    return Err(self.exhaust(session).await?);
                }
                return self
                    .ask_again(session, request, message)
                    .await
                    .map(Some);
            }
            Err(e) => {
                self.sessions.discard(session.id).await?;
                return Err(e);
            }
        }

        match self.router.route(&session.resolved, &session.pending) {
            RouterDecision::Clarify {
                request,
                confidence,
            } => {
                if !session.has_budget() {
                    return Err(self.exhaust(session).await?);
                }
                session.ask(request.clone());
                let id = session.id;
                self.sessions
                    .save(id, SessionRecord::Clarification(session))
                    .await?;
                Ok(Some(QueryResponse::clarification(request, confidence, id)))
            }
            RouterDecision::Execute { confidence } => {
                self.finish_session(session, confidence, Vec::new()).await.map(Some)
            }
            RouterDecision::ExecuteWithNote { confidence, notes } => {
                self.finish_session(session, confidence, notes).await.map(Some)
            }
        }
    }

    async fn ask_again(
        &self,
        mut session: ClarificationSession,
        request: ClarificationRequest,
        reason: String,
    ) -> Result<QueryResponse> {
        let id = session.id;
        let confidence = self.router.overall_confidence(&session.resolved).min(request.confidence);
        session.ask(request.clone());
        self.sessions
            .save(id, SessionRecord::Clarification(session))
            .await?;
        let mut response = QueryResponse::clarification(request, confidence, id);
        response.notes.push(reason);
        Ok(response)
    }

    async fn exhaust(&self, mut session: ClarificationSession) -> Result<AppError> {
        let err = session.exhaust();
        self.sessions.discard(session.id).await?;
        Ok(err)
    }

    async fn finish_session(
        &self,
        mut session: ClarificationSession,
        confidence: f32,
        notes: Vec<String>,
    ) -> Result<QueryResponse> {
        session.mark_resolved();
        self.sessions.discard(session.id).await?;
        let params = session.resolved_in_order();
        self.run_template(
            &session.template,
            &params,
            confidence,
            notes,
            &session.original_question,
        )
        .await
    }

    async fn continue_confirmation(
        &self,
        session_id: Uuid,
        pending: PendingConfirmation,
        answer: &str,
    ) -> Result<Option<QueryResponse>> {
        self.sessions.discard(session_id).await?;
        match confirmation_reply(answer) {
            ConfirmationReply::Run => {
                info!("Session {}: generated query confirmed", session_id);
                self.validate_and_execute(pending.query, pending.notes, &pending.question)
                    .await
                    .map(Some)
            }
            ConfirmationReply::Cancel => {
                info!("Session {}: generated query declined", session_id);
                Ok(Some(QueryResponse {
                    query_source: Some(QuerySource::Dynamic),
                    confidence_score: pending.card.confidence,
                    notes: vec!["Query cancelled.".to_string()],
                    ..Default::default()
                }))
            }
            ConfirmationReply::Other => Ok(None),
        }
    }

    async fn run_template(
        &self,
        template: &QueryTemplate,
        params: &[ExtractedParameter],
        confidence: f32,
        notes: Vec<String>,
        question: &str,
    ) -> Result<QueryResponse> {
        let resolved = resolve_template(template, params, confidence).map_err(|e| {
            error!("Template '{}' failed to render: {}", template.id, e);
            e
        })?;
        self.validate_and_execute(resolved, notes, question).await
    }

    async fn dynamic_path(&self, question: &str) -> Result<QueryResponse> {
        let tables = self.schema_search.search(question).await?;
        let outcome = match self.dynamic_builder.build(question, &tables).await? {
            DynamicBuild::Query(outcome) => outcome,
            DynamicBuild::NeedsClarification {
                question: prompt,
                options,
            } => {
                // No state to resume: the user's reply is a new question.
                return Ok(QueryResponse {
                    query_source: Some(QuerySource::Dynamic),
                    needs_clarification: true,
                    clarification: Some(ClarificationRequest {
                        parameter: "question".to_string(),
                        prompt,
                        best_guess: None,
                        confidence: 0.0,
                        alternatives: options,
                    }),
                    ..Default::default()
                });
            }
        };

        let resolved = ResolvedQuery {
            sql: outcome.sql,
            source: QuerySource::Dynamic,
            confidence: outcome.confidence,
            tables: outcome.tables_used,
            template_id: None,
        };
        // Unsafe SQL never reaches a confirmation card.
        self.validator.check(&resolved.sql)?;

        let mut notes = outcome.notes;
        match self.router.route_dynamic(resolved.confidence) {
            DynamicGate::Execute => self.validate_and_execute(resolved, notes, question).await,
            DynamicGate::ExecuteWithNote => {
                notes.push(format!(
                    "Generated query (confidence {:.2}); no saved query matched the question.",
                    resolved.confidence
                ));
                self.validate_and_execute(resolved, notes, question).await
            }
            DynamicGate::Confirm => {
                let card = ConfirmationCard {
                    prompt: "No saved query matched and the generated one may not answer the question. Run it?"
                        .to_string(),
                    sql: resolved.sql.clone(),
                    confidence: resolved.confidence,
                    tables_used: resolved.tables.clone(),
                    reasoning: outcome.reasoning,
                };
                let id = Uuid::new_v4();
                info!(
                    "Generated query parked for confirmation in session {} ({:.2})",
                    id, resolved.confidence
                );
                self.sessions
                    .save(
                        id,
                        SessionRecord::Confirmation(PendingConfirmation {
                            question: question.to_string(),
                            card: card.clone(),
                            query: resolved,
                            notes: notes.clone(),
                            created_at: Utc::now(),
                        }),
                    )
                    .await?;
                let mut response = QueryResponse::confirmation(card, id);
                response.notes = notes;
                Ok(response)
            }
        }
    }

    async fn validate_and_execute(
        &self,
        resolved: ResolvedQuery,
        notes: Vec<String>,
        question: &str,
    ) -> Result<QueryResponse> {
        self.validator.check(&resolved.sql)?;
        match self.executor.execute(&resolved.sql).await {
            Ok(result) => Ok(QueryResponse::executed(&resolved, result, notes)),
            Err(AppError::Execution {
                kind: ExecutionErrorKind::Schema,
                message,
                ..
            }) => {
                let suggestions = match self.schema_search.search(question).await {
                    Ok(tables) => tables.iter().map(|t| t.qualified_name()).collect(),
                    Err(e) => {
                        warn!("Schema search for recovery suggestions failed: {}", e);
                        Vec::new()
                    }
                };
                Err(AppError::Execution {
                    kind: ExecutionErrorKind::Schema,
                    message,
                    suggestions,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_length_is_validated() {
        assert!(QueryRequest::new("top 5 suppliers").validate().is_ok());
        assert!(QueryRequest::new("").validate().is_err());
        assert!(QueryRequest::new("x".repeat(4001)).validate().is_err());
    }

    #[test]
    fn test_request_deserializes_optional_fields() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"question": "q", "reference_date": "2016-05-31"}"#,
        )
        .unwrap();
        assert_eq!(request.session_id, None);
        assert_eq!(request.reference_date, NaiveDate::from_ymd_opt(2016, 5, 31));
    }
}
