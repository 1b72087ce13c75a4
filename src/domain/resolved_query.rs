use crate::domain::parameter::ClarificationRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    Template,
    Dynamic,
}

/// SQL ready for the validator. Never contains an unsubstituted token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuery {
    pub sql: String,
    pub source: QuerySource,
    pub confidence: f32,
    pub tables: Vec<String>,
    pub template_id: Option<String>,
}

/// Rows returned by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
    /// Set when the executor's row ceiling cut the result short.
    pub truncated: bool,
}

/// "Run this query?" gate for low-confidence dynamic SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationCard {
    pub prompt: String,
    pub sql: String,
    pub confidence: f32,
    pub tables_used: Vec<String>,
    pub reasoning: String,
}

/// Outbound shape of one pipeline turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sql_query: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub confidence_score: f32,
    pub query_source: Option<QuerySource>,
    pub needs_clarification: bool,
    pub clarification: Option<ClarificationRequest>,
    pub confirmation: Option<ConfirmationCard>,
    /// "Assuming X for Y" notes for medium-confidence values.
    pub notes: Vec<String>,
    pub session_id: Option<Uuid>,
}

impl QueryResponse {
    pub fn executed(resolved: &ResolvedQuery, result: QueryResult, notes: Vec<String>) -> Self {
        Self {
            sql_query: Some(resolved.sql.clone()),
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            truncated: result.truncated,
            confidence_score: resolved.confidence,
            query_source: Some(resolved.source),
            notes,
            ..Default::default()
        }
    }

    pub fn clarification(
        request: ClarificationRequest,
        confidence: f32,
        session_id: Uuid,
    ) -> Self {
        Self {
            confidence_score: confidence,
            query_source: Some(QuerySource::Template),
            needs_clarification: true,
            clarification: Some(request),
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    pub fn confirmation(card: ConfirmationCard, session_id: Uuid) -> Self {
        Self {
            confidence_score: card.confidence,
            query_source: Some(QuerySource::Dynamic),
            needs_clarification: true,
            confirmation: Some(card),
            session_id: Some(session_id),
            ..Default::default()
        }
    }
}
