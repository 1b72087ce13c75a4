//! Dynamic Query Builder
//!
//! Fallback when no template clears acceptance. The LLM writes SQL from the
//! supplied table metadata only; its declared `tables_used` must all come
//! from that metadata. Column policy (3 to 8 columns, an id/name column, no
//! `SELECT *`) adjusts the self-reported confidence rather than rewriting SQL.

use crate::application::use_cases::llm_contract::{ask_llm, LlmOutcome};
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::LLMConfig;
use crate::domain::parameter::clamp_confidence;
use crate::domain::schema::TableMetadata;
use crate::infrastructure::llm_clients::LLMClient;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const MIN_COLUMNS: usize = 3;
pub const MAX_COLUMNS: usize = 8;
pub const COLUMN_POLICY_PENALTY: f32 = 0.1;
const UNSTATED_CONFIDENCE: f32 = 0.5;

static SELECT_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bselect\s+(?:distinct\s+)?(?:top\s+\d+\s+)?(?:\w+\.)?\*").unwrap());

static SELECT_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bselect\b").unwrap());

/// `id`, `s.name`, `supplier_id` or `SupplierID`, but not `paid` or `valid`.
static IDENTIFYING_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\b|_)(?i:id|name)\b|[a-z](?:ID|Id|Name)\b").unwrap()
});

#[derive(Debug, Deserialize)]
struct GeneratedSql {
    sql: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    tables_used: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicQueryOutcome {
    pub sql: String,
    pub confidence: f32,
    pub tables_used: Vec<String>,
    pub reasoning: String,
    /// Column-policy findings that lowered the confidence.
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DynamicBuild {
    Query(DynamicQueryOutcome),
    NeedsClarification {
        question: String,
        options: Vec<String>,
    },
}

/// Top-level items between the first SELECT and its FROM.
pub fn select_items(sql: &str) -> Vec<String> {
    let Some(keyword) = SELECT_KEYWORD.find(sql) else {
        return Vec::new();
    };
    let body: Vec<char> = sql[keyword.end()..].chars().collect();

    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            _ if depth == 0 && is_keyword_at(&body, i, "FROM") => break,
            _ => current.push(c),
        }
        i += 1;
    }
    items.push(current);
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_keyword_at(chars: &[char], i: usize, keyword: &str) -> bool {
    let len = keyword.len();
    if i + len > chars.len() {
        return false;
    }
    let before_ok = i == 0 || !(chars[i - 1].is_alphanumeric() || chars[i - 1] == '_');
    let after_ok = i + len == chars.len()
        || !(chars[i + len].is_alphanumeric() || chars[i + len] == '_');
    let word: String = chars[i..i + len].iter().collect();
    before_ok && after_ok && word.eq_ignore_ascii_case(keyword)
}

pub struct DynamicQueryBuilder {
    llm_client: Arc<dyn LLMClient + Send + Sync>,
    config: LLMConfig,
}

impl DynamicQueryBuilder {
    pub fn new(llm_client: Arc<dyn LLMClient + Send + Sync>, config: LLMConfig) -> Self {
        Self { llm_client, config }
    }

    pub async fn build(&self, question: &str, candidate_tables: &[TableMetadata]) -> Result<DynamicBuild> {
        if candidate_tables.is_empty() {
            return Err(AppError::NoMatchingQuery(
                "no known table relates to the question".to_string(),
            ));
        }

        let prompt = build_prompt(question, candidate_tables);
        let outcome: LlmOutcome<GeneratedSql> = ask_llm(
            self.llm_client.as_ref(),
            &self.config,
            "You write one read-only SQL SELECT statement using only the tables and columns you are given. Reply with JSON only.",
            &prompt,
        )
        .await;

        match outcome {
            LlmOutcome::Success(generated) => {
                Self::check(generated, candidate_tables).map(DynamicBuild::Query)
            }
            LlmOutcome::NeedsClarification {
                question, options, ..
            } => Ok(DynamicBuild::NeedsClarification { question, options }),
            LlmOutcome::Error { message } => Err(AppError::LLMError(format!(
                "SQL generation failed: {}",
                message
            ))),
        }
    }

    fn check(generated: GeneratedSql, candidates: &[TableMetadata]) -> Result<DynamicQueryOutcome> {
        let sql = generated.sql.trim().to_string();
        if sql.is_empty() {
            return Err(AppError::LLMError("SQL generation returned no SQL".to_string()));
        }

        if generated.tables_used.is_empty() {
            warn!("Generated SQL declared no tables");
            return Err(AppError::NoMatchingQuery(
                "could not build a query from the known tables".to_string(),
            ));
        }
        if let Some(unknown) = generated
            .tables_used
            .iter()
            .find(|t| !candidates.iter().any(|c| c.is_named(t)))
        {
            warn!("Generated SQL uses table '{}' outside the candidate list", unknown);
            return Err(AppError::NoMatchingQuery(
                "could not build a query from the known tables".to_string(),
            ));
        }

        if SELECT_STAR.is_match(&sql) {
            warn!("Generated SQL selects every column");
            return Err(AppError::NoMatchingQuery(
                "could not build a focused query for the question".to_string(),
            ));
        }

        let mut confidence = clamp_confidence(generated.confidence.unwrap_or(UNSTATED_CONFIDENCE));
        let mut notes = Vec::new();
        let items = select_items(&sql);
        if items.len() < MIN_COLUMNS || items.len() > MAX_COLUMNS {
            confidence -= COLUMN_POLICY_PENALTY;
            notes.push(format!(
                "Query returns {} columns; {} to {} is preferred",
                items.len(),
                MIN_COLUMNS,
                MAX_COLUMNS
            ));
        }
        if !items.iter().any(|item| IDENTIFYING_COLUMN.is_match(item)) {
            confidence -= COLUMN_POLICY_PENALTY;
            notes.push("Query has no identifying id or name column".to_string());
        }

        let outcome = DynamicQueryOutcome {
            sql,
            confidence: clamp_confidence(confidence),
            tables_used: generated.tables_used,
            reasoning: generated.reasoning,
            notes,
        };
        info!(
            "Dynamic SQL over {:?} (confidence {:.2})",
            outcome.tables_used, outcome.confidence
        );
        Ok(outcome)
    }
}

fn build_prompt(question: &str, tables: &[TableMetadata]) -> String {
    let schema = tables
        .iter()
        .map(|t| {
            let columns = t
                .columns
                .iter()
                .map(|c| match &c.data_type {
                    Some(ty) => format!("{} {}", c.name, ty),
                    None => c.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            match &t.description {
                Some(d) => format!("- {} ({}): {}", t.qualified_name(), d, columns),
                None => format!("- {}: {}", t.qualified_name(), columns),
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"TABLES (the only identifiers you may use):
{}

QUESTION: "{}"

Rules:
- a single SELECT statement, no comments, no semicolon chaining
- never SELECT *; return {} to {} useful columns including an id or name column
- qualify tables with their schema

Reply with ONE of:
{{"status": "success", "sql": "<SELECT ...>", "confidence": <0.0-1.0>, "tables_used": ["Schema.Table"], "reasoning": "<short>"}}
{{"status": "needs_clarification", "question": "<what is unclear>", "options": ["..."]}}
{{"status": "error", "message": "<why the tables cannot answer it>"}}"#,
        schema, question, MIN_COLUMNS, MAX_COLUMNS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::ColumnMetadata;
    use async_trait::async_trait;

    struct CannedLlm(String);

    #[async_trait]
    impl LLMClient for CannedLlm {
        async fn generate(&self, _c: &LLMConfig, _s: &str, _u: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn tables() -> Vec<TableMetadata> {
        vec![TableMetadata {
            schema: "Purchasing".into(),
            table: "Suppliers".into(),
            description: None,
            aliases: vec![],
            columns: vec![ColumnMetadata {
                name: "SupplierName".into(),
                data_type: Some("nvarchar".into()),
                description: None,
            }],
        }]
    }

    fn builder(reply: &str) -> DynamicQueryBuilder {
        DynamicQueryBuilder::new(Arc::new(CannedLlm(reply.to_string())), LLMConfig::default())
    }

    #[test]
    fn test_select_items_ignores_nested_commas() {
        let items = select_items(
            "SELECT s.SupplierID, s.SupplierName, COALESCE(a, 'x,y') AS c FROM Purchasing.Suppliers s",
        );
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], "COALESCE(a, 'x,y') AS c");
    }

    #[test]
    fn test_identifying_column_needs_a_word_boundary() {
        for item in ["id", "s.SupplierID", "supplier_id", "SupplierName", "c.NAME AS who"] {
            assert!(IDENTIFYING_COLUMN.is_match(item), "{}", item);
        }
        for item in ["paid", "valid", "SUM(amount_paid) AS total", "rename_count"] {
            assert!(!IDENTIFYING_COLUMN.is_match(item), "{}", item);
        }
    }

    #[tokio::test]
    async fn test_well_formed_query_keeps_confidence() {
        let b = builder(
            r#"{"status": "success", "sql": "SELECT SupplierID, SupplierName, PhoneNumber FROM Purchasing.Suppliers", "confidence": 0.8, "tables_used": ["Purchasing.Suppliers"], "reasoning": "direct"}"#,
        );
        match b.build("list suppliers", &tables()).await.unwrap() {
            DynamicBuild::Query(q) => {
                assert!((q.confidence - 0.8).abs() < 1e-6);
                assert!(q.notes.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_column_policy_penalises() {
        let b = builder(
            r#"{"status": "success", "sql": "SELECT COUNT(*) FROM Purchasing.Suppliers", "confidence": 0.9, "tables_used": ["Suppliers"]}"#,
        );
        match b.build("how many suppliers", &tables()).await.unwrap() {
            DynamicBuild::Query(q) => {
                assert!((q.confidence - 0.7).abs() < 1e-6);
                assert_eq!(q.notes.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invented_table_rejected() {
        let b = builder(
            r#"{"status": "success", "sql": "SELECT a, b, c FROM Secret.Salaries", "confidence": 0.9, "tables_used": ["Secret.Salaries"]}"#,
        );
        assert!(matches!(
            b.build("salaries", &tables()).await,
            Err(AppError::NoMatchingQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_select_star_rejected() {
        let b = builder(
            r#"{"status": "success", "sql": "SELECT * FROM Purchasing.Suppliers", "confidence": 0.9, "tables_used": ["Purchasing.Suppliers"]}"#,
        );
        assert!(b.build("suppliers", &tables()).await.is_err());
    }

    #[tokio::test]
    async fn test_needs_clarification_passes_through() {
        let b = builder(r#"{"status": "needs_clarification", "question": "Which year?", "options": ["2015", "2016"]}"#);
        assert!(matches!(
            b.build("suppliers by year", &tables()).await.unwrap(),
            DynamicBuild::NeedsClarification { .. }
        ));
    }
}
