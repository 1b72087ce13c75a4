use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::application::use_cases::dynamic_query_builder::DynamicQueryBuilder;
use crate::application::use_cases::parameter_extractor::ParameterExtractor;
use crate::application::use_cases::query_validator::QueryValidator;
use crate::application::use_cases::schema_search::KeywordSchemaSearch;
use crate::application::use_cases::template_matcher::TemplateMatcher;
use crate::application::use_cases::template_search::{
    KeywordTemplateSearch, LlmTemplateSearch, TemplateSearch,
};
use crate::application::{PipelineComponents, QueryPipeline};
use crate::domain::error::Result;
use crate::infrastructure::catalog::{SchemaCatalog, TemplateCatalog};
use crate::infrastructure::config::{AppConfig, TemplateSearchMode};
use crate::infrastructure::db;
use crate::infrastructure::llm_clients::{LLMClient, OpenAIClient};
use crate::infrastructure::session_store::InMemorySessionStore;

const SCHEMA_SEARCH_MAX_TABLES: usize = 5;

/// Wire the pipeline from configuration. Catalogs are loaded once here and
/// shared read-only from then on.
pub async fn build_pipeline(config: &AppConfig) -> Result<QueryPipeline> {
    let templates = Arc::new(TemplateCatalog::load(&config.catalog.templates_path)?);
    let schema = Arc::new(match &config.catalog.schema_path {
        Some(path) => SchemaCatalog::load(path)?,
        None => SchemaCatalog::new(Vec::new()),
    });
    info!(
        templates = templates.len(),
        tables = schema.tables().len(),
        "Catalogs loaded"
    );

    let llm_client: Arc<dyn LLMClient + Send + Sync> = Arc::new(OpenAIClient::new());
    let search: Arc<dyn TemplateSearch + Send + Sync> = match config.catalog.template_search {
        TemplateSearchMode::Keyword => Arc::new(KeywordTemplateSearch::new(templates.clone())),
        TemplateSearchMode::Llm => Arc::new(LlmTemplateSearch::new(
            llm_client.clone(),
            config.llm.clone(),
            templates.clone(),
        )),
    };

    let components = PipelineComponents {
        matcher: TemplateMatcher::new(search, config.routing.acceptance_threshold),
        extractor: ParameterExtractor::new(
            llm_client.clone(),
            config.llm.clone(),
            config.routing.default_confidence,
        ),
        dynamic_builder: DynamicQueryBuilder::new(llm_client, config.llm.clone()),
        schema_search: Arc::new(KeywordSchemaSearch::new(schema, SCHEMA_SEARCH_MAX_TABLES)),
        validator: QueryValidator::new(&config.allowlist),
        executor: db::executor::connect(&config.database).await?,
        sessions: Arc::new(InMemorySessionStore::with_ttl(Duration::from_secs(
            config.sessions.ttl_secs,
        ))),
    };

    Ok(QueryPipeline::new(
        components,
        &config.routing,
        config.reference_date,
    ))
}

pub async fn run() -> std::result::Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let config = AppConfig::load().map_err(|err| {
        error!(error = %err, "Failed to load configuration");
        err
    })?;

    let pipeline = build_pipeline(&config).await.map_err(|err| {
        error!(error = %err, "Failed to initialise the query pipeline");
        err
    })?;

    let server = crate::interfaces::http::start_server(Arc::new(pipeline), &config.server)?;
    server.await?;
    Ok(())
}
