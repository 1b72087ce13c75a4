pub mod error;
pub mod llm_config;
pub mod parameter;
pub mod query_template;
pub mod resolved_query;
pub mod schema;
