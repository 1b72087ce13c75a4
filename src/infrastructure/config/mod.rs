//! Process configuration.
//!
//! Layers, later wins: built-in defaults, optional TOML file
//! (`SQLGATE_CONFIG`, default `sqlgate.toml`), then `SQLGATE_*` environment
//! variables with `__` separating nested keys, e.g.
//! `SQLGATE_ROUTING__MEDIUM_THRESHOLD=0.55`.

use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::LLMConfig;
use chrono::NaiveDate;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_PREFIX: &str = "SQLGATE_";
pub const CONFIG_PATH_VAR: &str = "SQLGATE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "sqlgate.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://...` or `sqlite:...`
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    /// Hard ceiling on returned rows.
    pub max_rows: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
            connect_timeout_secs: 5,
            query_timeout_secs: 30,
            max_rows: 1000,
        }
    }
}

/// Confidence tiers and clarification limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Minimum template search score for the template path.
    pub acceptance_threshold: f32,
    pub high_threshold: f32,
    pub medium_threshold: f32,
    /// Confidence given to values that came from `default_value`.
    pub default_confidence: f32,
    /// How far another template must outscore the session's template
    /// before a reply counts as a new topic.
    pub topic_change_margin: f32,
    pub max_clarification_turns: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.85,
            high_threshold: 0.85,
            medium_threshold: 0.6,
            default_confidence: 0.7,
            topic_change_margin: 0.1,
            max_clarification_turns: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSearchMode {
    Keyword,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub templates_path: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub template_search: TemplateSearchMode,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            templates_path: PathBuf::from("templates.json"),
            schema_path: None,
            template_search: TemplateSearchMode::Keyword,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistConfig {
    /// `Schema.Table` or `Schema.*` entries.
    pub tables: Vec<String>,
    /// Schema assumed for unqualified table references.
    pub default_schema: Option<String>,
    /// Extra words rejected on top of the built-in DDL/DML list.
    pub deny_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds a parked clarification or confirmation stays answerable.
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 1800 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub database: DatabaseConfig,
    pub routing: RoutingConfig,
    pub catalog: CatalogConfig,
    pub allowlist: AllowlistConfig,
    pub sessions: SessionConfig,
    /// "Today" for relative date phrases. The dataset is historical.
    pub reference_date: Option<NaiveDate>,
}

impl AppConfig {
    pub fn figment(path: impl Into<PathBuf>) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.into()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| AppError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;
        for (name, value) in [
            ("acceptance_threshold", r.acceptance_threshold),
            ("high_threshold", r.high_threshold),
            ("medium_threshold", r.medium_threshold),
            ("default_confidence", r.default_confidence),
            ("topic_change_margin", r.topic_change_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::Configuration(format!(
                    "routing.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if r.medium_threshold > r.high_threshold {
            return Err(AppError::Configuration(format!(
                "routing.medium_threshold ({}) exceeds routing.high_threshold ({})",
                r.medium_threshold, r.high_threshold
            )));
        }
        if r.max_clarification_turns == 0 {
            return Err(AppError::Configuration(
                "routing.max_clarification_turns must be at least 1".to_string(),
            ));
        }
        if self.sessions.ttl_secs == 0 {
            return Err(AppError::Configuration(
                "sessions.ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.database.max_rows == 0 {
            return Err(AppError::Configuration(
                "database.max_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
