//! Immutable snapshots of query templates and table metadata.
//!
//! Loaded once at startup, shared through `Arc`, never mutated.

use crate::application::use_cases::parameter_validator::ParameterValidator;
use crate::domain::error::{AppError, Result};
use crate::domain::query_template::QueryTemplate;
use crate::domain::schema::TableMetadata;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: Vec<Arc<QueryTemplate>>,
}

impl TemplateCatalog {
    /// Build a catalog, refusing templates that could never resolve cleanly.
    pub fn from_templates(templates: Vec<QueryTemplate>) -> Result<Self> {
        let mut ids = HashSet::new();
        for template in &templates {
            if !ids.insert(template.id.as_str()) {
                return Err(AppError::Configuration(format!(
                    "Duplicate template id '{}'",
                    template.id
                )));
            }
            Self::check_template(template)?;
        }

        Ok(Self {
            templates: templates.into_iter().map(Arc::new).collect(),
        })
    }

    fn check_template(template: &QueryTemplate) -> Result<()> {
        let mut names = HashSet::new();
        for spec in &template.parameters {
            if !names.insert(spec.name.as_str()) {
                return Err(AppError::Configuration(format!(
                    "Template '{}' declares parameter '{}' twice",
                    template.id, spec.name
                )));
            }
            ParameterValidator::check_bounds(spec).map_err(|e| {
                AppError::Configuration(format!("Template '{}': {}", template.id, e))
            })?;
            if let Some(default) = &spec.default_value {
                ParameterValidator::check(spec, default).map_err(|e| {
                    AppError::Configuration(format!(
                        "Template '{}' default for '{}' is invalid: {}",
                        template.id, spec.name, e
                    ))
                })?;
            }
            if spec.is_misconfigured_when_unresolved() {
                warn!(
                    "Template '{}' parameter '{}' has no default and never asks; unresolved values will fail",
                    template.id, spec.name
                );
            }
        }

        for token in template.tokens() {
            if !names.contains(token.as_str()) {
                return Err(AppError::Configuration(format!(
                    "Template '{}' uses undeclared token '{}'",
                    template.id, token
                )));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("Cannot read templates {}: {}", path.display(), e))
        })?;
        let templates: Vec<QueryTemplate> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Configuration(format!("Invalid templates {}: {}", path.display(), e))
        })?;
        let catalog = Self::from_templates(templates)?;
        info!("Loaded {} query templates from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn templates(&self) -> &[Arc<QueryTemplate>] {
        &self.templates
    }

    pub fn get(&self, id: &str) -> Option<Arc<QueryTemplate>> {
        self.templates.iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SchemaCatalog {
    tables: Vec<TableMetadata>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableMetadata>) -> Self {
        Self { tables }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("Cannot read schema {}: {}", path.display(), e))
        })?;
        let tables: Vec<TableMetadata> = serde_json::from_str(&raw).map_err(|e| {
            AppError::Configuration(format!("Invalid schema {}: {}", path.display(), e))
        })?;
        info!("Loaded metadata for {} tables from {}", tables.len(), path.display());
        Ok(Self { tables })
    }

    pub fn tables(&self) -> &[TableMetadata] {
        &self.tables
    }

    pub fn find(&self, reference: &str) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.is_named(reference))
    }
}
