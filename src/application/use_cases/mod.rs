pub mod clarification_session;
pub mod confidence_router;
pub mod dynamic_query_builder;
pub mod fuzzy_match;
pub mod llm_contract;
pub mod parameter_extractor;
pub mod parameter_validator;
pub mod query_pipeline;
pub mod query_validator;
pub mod relative_date;
pub mod schema_search;
pub mod template_matcher;
pub mod template_search;
pub mod template_sql;
