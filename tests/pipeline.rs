use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;
use sqlgate_lib::application::use_cases::dynamic_query_builder::DynamicQueryBuilder;
use sqlgate_lib::application::use_cases::parameter_extractor::ParameterExtractor;
use sqlgate_lib::application::use_cases::query_validator::QueryValidator;
use sqlgate_lib::application::use_cases::schema_search::KeywordSchemaSearch;
use sqlgate_lib::application::use_cases::template_matcher::TemplateMatcher;
use sqlgate_lib::application::use_cases::template_search::KeywordTemplateSearch;
use sqlgate_lib::application::{PipelineComponents, QueryPipeline, QueryRequest};
use sqlgate_lib::domain::error::{AppError, ExecutionErrorKind, QueryRejection, Result};
use sqlgate_lib::domain::llm_config::LLMConfig;
use sqlgate_lib::domain::query_template::{QueryTemplate, TOKEN_OPEN};
use sqlgate_lib::domain::resolved_query::QuerySource;
use sqlgate_lib::domain::schema::TableMetadata;
use sqlgate_lib::infrastructure::catalog::{SchemaCatalog, TemplateCatalog};
use sqlgate_lib::infrastructure::config::{AllowlistConfig, DatabaseConfig, RoutingConfig};
use sqlgate_lib::infrastructure::db::{SqlExecutor, SqliteExecutor};
use sqlgate_lib::infrastructure::llm_clients::LLMClient;
use sqlgate_lib::infrastructure::session_store::InMemorySessionStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Answers extraction prompts per parameter name and SQL prompts with one
/// fixed reply. Anything unscripted gets the contract's error shape.
#[derive(Default)]
struct ScriptedLlm {
    params: HashMap<String, String>,
    sql_reply: Option<String>,
}

impl ScriptedLlm {
    fn param(mut self, name: &str, reply: serde_json::Value) -> Self {
        self.params.insert(name.to_string(), reply.to_string());
        self
    }

    fn sql(mut self, reply: serde_json::Value) -> Self {
        self.sql_reply = Some(reply.to_string());
        self
    }
}

#[async_trait]
impl LLMClient for ScriptedLlm {
    async fn generate(&self, _config: &LLMConfig, _system: &str, user: &str) -> Result<String> {
        let unscripted = json!({"status": "error", "message": "not stated"}).to_string();
        let first_line = user.lines().next().unwrap_or_default();
        if let Some(name) = first_line.strip_prefix("PARAMETER: ") {
            return Ok(self.params.get(name.trim()).cloned().unwrap_or(unscripted));
        }
        Ok(self.sql_reply.clone().unwrap_or(unscripted))
    }
}

fn templates() -> Vec<QueryTemplate> {
    serde_json::from_value(json!([
        {
            "id": "top_suppliers",
            "name": "Top suppliers by spend",
            "intent_keywords": ["suppliers by spend", "top suppliers"],
            "tables_used": ["suppliers"],
            "sql": "SELECT id, name, spend FROM suppliers ORDER BY spend %{{sort_order}}% LIMIT %{{top_n}}%",
            "parameters": [
                {"name": "sort_order", "type": "string", "allowed_values": ["ASC", "DESC"], "ask_if_missing": true},
                {"name": "top_n", "type": "integer", "min": 1, "max": 100, "default_value": "10"}
            ]
        },
        {
            "id": "supplier_report",
            "name": "Supplier report",
            "intent_keywords": ["supplier report"],
            "tables_used": ["suppliers"],
            "sql": "SELECT id, name, spend FROM suppliers WHERE category = '%{{category}}%' AND spend >= %{{min_spend}}% ORDER BY spend %{{sort_order}}%",
            "parameters": [
                {"name": "category", "type": "string", "allowed_values": ["Toys", "Clothing", "Packaging"], "ask_if_missing": true},
                {"name": "min_spend", "type": "integer", "min": 0, "max": 1000, "ask_if_missing": true},
                {"name": "sort_order", "type": "string", "allowed_values": ["ASC", "DESC"], "ask_if_missing": true}
            ]
        },
        {
            "id": "category_top",
            "name": "Suppliers in a category",
            "intent_keywords": ["suppliers overview"],
            "tables_used": ["suppliers"],
            "sql": "SELECT id, name, spend FROM suppliers WHERE category = '%{{category}}%' LIMIT %{{top_n}}%",
            "parameters": [
                {"name": "category", "type": "string", "allowed_values": ["Toys", "Clothing", "Packaging"], "ask_if_missing": true},
                {"name": "top_n", "type": "integer", "min": 1, "max": 100, "ask_if_missing": true}
            ]
        },
        {
            "id": "recent_orders",
            "name": "Recent orders",
            "intent_keywords": ["recent orders"],
            "tables_used": ["orders"],
            "sql": "SELECT id, supplier_id, amount FROM orders WHERE amount >= %{{min_amount}}% LIMIT %{{top_n}}%",
            "parameters": [
                {"name": "min_amount", "type": "integer", "min": 0, "default_value": "0"},
                {"name": "top_n", "type": "integer", "min": 1, "max": 100, "default_value": "10"}
            ]
        }
    ]))
    .unwrap()
}

fn tables() -> Vec<TableMetadata> {
    serde_json::from_value(json!([
        {
            "schema": "",
            "table": "suppliers",
            "aliases": ["vendors"],
            "columns": [{"name": "id"}, {"name": "name"}, {"name": "category"}, {"name": "spend"}]
        },
        {
            "schema": "",
            "table": "orders",
            "columns": [{"name": "id"}, {"name": "supplier_id"}, {"name": "amount"}]
        }
    ]))
    .unwrap()
}

struct Harness {
    pipeline: QueryPipeline,
    executor: Arc<SqliteExecutor>,
    sessions: Arc<InMemorySessionStore>,
}

async fn harness(llm: ScriptedLlm) -> Harness {
    let executor = Arc::new(SqliteExecutor::connect(&DatabaseConfig::default()).await.unwrap());
    for statement in [
        "CREATE TABLE suppliers (id INTEGER PRIMARY KEY, name TEXT, category TEXT, spend REAL)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, supplier_id INTEGER, amount INTEGER)",
        "INSERT INTO suppliers VALUES (1, 'Acme', 'Toys', 120.0), (2, 'Globex', 'Toys', 40.0), \
         (3, 'Initech', 'Clothing', 300.0), (4, 'Umbrella', 'Toys', 75.5), (5, 'Hooli', 'Packaging', 10.0)",
        "INSERT INTO orders VALUES (1, 1, 500), (2, 3, 20), (3, 4, 75)",
    ] {
        sqlx::query(statement).execute(executor.pool()).await.unwrap();
    }

    let catalog = Arc::new(TemplateCatalog::from_templates(templates()).unwrap());
    let schema = Arc::new(SchemaCatalog::new(tables()));
    let llm: Arc<dyn LLMClient + Send + Sync> = Arc::new(llm);
    let routing = RoutingConfig::default();
    let sessions = Arc::new(InMemorySessionStore::new());

    let components = PipelineComponents {
        matcher: TemplateMatcher::new(
            Arc::new(KeywordTemplateSearch::new(catalog)),
            routing.acceptance_threshold,
        ),
        extractor: ParameterExtractor::new(llm.clone(), LLMConfig::default(), routing.default_confidence),
        dynamic_builder: DynamicQueryBuilder::new(llm, LLMConfig::default()),
        schema_search: Arc::new(KeywordSchemaSearch::new(schema, 5)),
        validator: QueryValidator::new(&AllowlistConfig {
            tables: vec!["suppliers".into(), "orders".into()],
            default_schema: None,
            deny_keywords: vec![],
        }),
        executor: executor.clone(),
        sessions: sessions.clone(),
    };

    Harness {
        pipeline: QueryPipeline::new(components, &routing, NaiveDate::from_ymd_opt(2016, 5, 31)),
        executor,
        sessions,
    }
}

#[tokio::test]
async fn test_top_suppliers_resolve_to_descending_order() {
    let h = harness(ScriptedLlm::default().param(
        "top_n",
        json!({"status": "success", "value": 5, "confidence": 0.95}),
    ))
    .await;

    let response = h
        .pipeline
        .handle(QueryRequest::new("Top 5 suppliers by spend"))
        .await
        .unwrap();

    let sql = response.sql_query.unwrap();
    assert!(sql.contains("ORDER BY spend DESC"));
    assert!(sql.contains("LIMIT 5"));
    assert!(!response.needs_clarification);
    assert_eq!(response.query_source, Some(QuerySource::Template));
    assert_eq!(response.row_count, 5);
    assert_eq!(response.rows[0]["name"], json!("Initech"));
    assert!(response.confidence_score >= 0.85);
}

#[tokio::test]
async fn test_three_turn_clarification_reaches_resolved() {
    let h = harness(ScriptedLlm::default()).await;

    let first = h
        .pipeline
        .handle(QueryRequest::new("supplier report"))
        .await
        .unwrap();
    assert!(first.needs_clarification);
    let session_id = first.session_id.unwrap();

    let mut asked = vec![first.clarification.unwrap().parameter];
    let mut last = None;
    for answer in ["Toys", "50", "DESC"] {
        let response = h
            .pipeline
            .handle(QueryRequest::new(answer).in_session(session_id))
            .await
            .unwrap();
        if let Some(request) = &response.clarification {
            assert!(!asked.contains(&request.parameter), "re-asked {}", request.parameter);
            asked.push(request.parameter.clone());
        }
        last = Some(response);
    }

    assert_eq!(asked, vec!["category", "min_spend", "sort_order"]);
    let done = last.unwrap();
    assert!(!done.needs_clarification);
    assert_eq!(done.row_count, 2);
    assert_eq!(done.rows[0]["name"], json!("Acme"));
    assert!(!done.sql_query.unwrap().contains(TOKEN_OPEN));
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_defaults_leave_no_tokens_and_add_notes() {
    let h = harness(ScriptedLlm::default()).await;

    let response = h
        .pipeline
        .handle(QueryRequest::new("show recent orders"))
        .await
        .unwrap();

    let sql = response.sql_query.unwrap();
    assert!(!sql.contains(TOKEN_OPEN));
    assert_eq!(response.row_count, 3);
    assert!(response.notes.iter().any(|n| n == "Assuming 10 for top_n"));
    assert!(response.notes.iter().any(|n| n == "Assuming 0 for min_amount"));
    assert!(response.confidence_score < 0.85);
}

#[tokio::test]
async fn test_weakest_parameter_blocks_execution() {
    let h = harness(
        ScriptedLlm::default()
            .param("category", json!({"status": "success", "value": "Toys", "confidence": 0.4}))
            .param("top_n", json!({"status": "success", "value": 3, "confidence": 0.9})),
    )
    .await;

    let response = h
        .pipeline
        .handle(QueryRequest::new("toys suppliers overview"))
        .await
        .unwrap();

    assert!(response.needs_clarification);
    assert!(response.sql_query.is_none());
    let request = response.clarification.unwrap();
    assert_eq!(request.parameter, "category");
    assert_eq!(request.best_guess.as_deref(), Some("Toys"));
    assert!(response.confidence_score < 0.6);
}

#[tokio::test]
async fn test_yes_confirms_low_confidence_guess() {
    let h = harness(
        ScriptedLlm::default()
            .param("category", json!({"status": "success", "value": "Toys", "confidence": 0.4}))
            .param("top_n", json!({"status": "success", "value": 3, "confidence": 0.9})),
    )
    .await;

    let first = h
        .pipeline
        .handle(QueryRequest::new("toys suppliers overview"))
        .await
        .unwrap();
    assert!(first.clarification.unwrap().prompt.contains("Did you mean Toys?"));

    let confirmed = h
        .pipeline
        .handle(QueryRequest::new("yes").in_session(first.session_id.unwrap()))
        .await
        .unwrap();

    assert!(!confirmed.needs_clarification);
    let sql = confirmed.sql_query.unwrap();
    assert!(sql.contains("category = 'Toys'"));
    assert!(!sql.contains("'yes'"));
    assert_eq!(confirmed.row_count, 3);
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_invalid_answer_reprompts_same_parameter() {
    let h = harness(ScriptedLlm::default()).await;
    let first = h
        .pipeline
        .handle(QueryRequest::new("supplier report"))
        .await
        .unwrap();
    let session_id = first.session_id.unwrap();
    h.pipeline
        .handle(QueryRequest::new("Clothing").in_session(session_id))
        .await
        .unwrap();

    let response = h
        .pipeline
        .handle(QueryRequest::new("5000").in_session(session_id))
        .await
        .unwrap();

    assert!(response.needs_clarification);
    assert_eq!(response.clarification.unwrap().parameter, "min_spend");
    assert_eq!(response.session_id, Some(session_id));
    assert!(!response.notes.is_empty());
}

#[tokio::test]
async fn test_turn_budget_exhaustion_is_fatal() {
    let h = harness(ScriptedLlm::default()).await;
    let first = h
        .pipeline
        .handle(QueryRequest::new("supplier report"))
        .await
        .unwrap();
    let session_id = first.session_id.unwrap();

    for answer in ["zzz", "qqq"] {
        let response = h
            .pipeline
            .handle(QueryRequest::new(answer).in_session(session_id))
            .await
            .unwrap();
        assert_eq!(response.clarification.unwrap().parameter, "category");
    }
    let err = h
        .pipeline
        .handle(QueryRequest::new("www").in_session(session_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ClarificationExhausted(_)));
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_new_topic_abandons_session() {
    let h = harness(ScriptedLlm::default().param(
        "top_n",
        json!({"status": "success", "value": 5, "confidence": 0.95}),
    ))
    .await;
    let first = h
        .pipeline
        .handle(QueryRequest::new("supplier report"))
        .await
        .unwrap();

    let response = h
        .pipeline
        .handle(QueryRequest::new("Top 5 suppliers by spend").in_session(first.session_id.unwrap()))
        .await
        .unwrap();

    assert!(!response.needs_clarification);
    assert!(response.sql_query.unwrap().contains("DESC"));
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_chained_dynamic_statement_is_rejected() {
    let h = harness(ScriptedLlm::default().sql(json!({
        "status": "success",
        "sql": "SELECT id, name, spend FROM suppliers; DROP TABLE suppliers;",
        "confidence": 0.95,
        "tables_used": ["suppliers"]
    })))
    .await;

    let err = h
        .pipeline
        .handle(QueryRequest::new("which suppliers have the highest spend"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::UnsafeStatement(QueryRejection::MultipleStatements)
    ));
    let still_there = h.executor.execute("SELECT id FROM suppliers").await.unwrap();
    assert_eq!(still_there.row_count, 5);
}

#[tokio::test]
async fn test_table_after_derived_table_is_checked() {
    let h = harness(ScriptedLlm::default().sql(json!({
        "status": "success",
        "sql": "SELECT x.id, m.name, m.sql FROM (SELECT 1 AS id) AS x, sqlite_master m",
        "confidence": 0.95,
        "tables_used": ["suppliers"]
    })))
    .await;

    let err = h
        .pipeline
        .handle(QueryRequest::new("which suppliers have the highest spend"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::UnsafeStatement(QueryRejection::TableNotAllowed(ref table)) if table == "sqlite_master"
    ));
}

#[tokio::test]
async fn test_low_confidence_dynamic_query_waits_for_confirmation() {
    let h = harness(ScriptedLlm::default().sql(json!({
        "status": "success",
        "sql": "SELECT id, name, spend FROM suppliers ORDER BY spend DESC",
        "confidence": 0.4,
        "tables_used": ["suppliers"],
        "reasoning": "spend is the closest measure"
    })))
    .await;

    let first = h
        .pipeline
        .handle(QueryRequest::new("which suppliers have the highest spend"))
        .await
        .unwrap();
    assert!(first.needs_clarification);
    assert!(first.rows.is_empty());
    let card = first.confirmation.unwrap();
    assert!(card.sql.contains("ORDER BY spend DESC"));

    let confirmed = h
        .pipeline
        .handle(QueryRequest::new("yes").in_session(first.session_id.unwrap()))
        .await
        .unwrap();
    assert_eq!(confirmed.query_source, Some(QuerySource::Dynamic));
    assert_eq!(confirmed.row_count, 5);
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_declined_confirmation_runs_nothing() {
    let h = harness(ScriptedLlm::default().sql(json!({
        "status": "success",
        "sql": "SELECT id, name, spend FROM suppliers",
        "confidence": 0.3,
        "tables_used": ["suppliers"]
    })))
    .await;

    let first = h
        .pipeline
        .handle(QueryRequest::new("list suppliers"))
        .await
        .unwrap();
    let declined = h
        .pipeline
        .handle(QueryRequest::new("no").in_session(first.session_id.unwrap()))
        .await
        .unwrap();

    assert!(declined.sql_query.is_none());
    assert_eq!(declined.row_count, 0);
    assert_eq!(h.sessions.len().await, 0);
}

#[tokio::test]
async fn test_unknown_column_suggests_tables() {
    let h = harness(ScriptedLlm::default().sql(json!({
        "status": "success",
        "sql": "SELECT id, name, rating FROM suppliers",
        "confidence": 0.95,
        "tables_used": ["suppliers"]
    })))
    .await;

    let err = h
        .pipeline
        .handle(QueryRequest::new("rate our suppliers"))
        .await
        .unwrap_err();

    match err {
        AppError::Execution {
            kind: ExecutionErrorKind::Schema,
            suggestions,
            ..
        } => assert!(suggestions.contains(&"suppliers".to_string())),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_question_without_known_tables_has_no_match() {
    let h = harness(ScriptedLlm::default()).await;
    let err = h
        .pipeline
        .handle(QueryRequest::new("weather in Jakarta"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoMatchingQuery(_)));
}
