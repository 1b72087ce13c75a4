//! Table search for the dynamic query path.
//!
//! Tables are matched against the question by name, configured aliases and
//! the domain terms hidden in their column names (`customer_id` -> customer).

use crate::application::use_cases::fuzzy_match::normalize;
use crate::domain::error::Result;
use crate::domain::schema::TableMetadata;
use crate::infrastructure::catalog::SchemaCatalog;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait SchemaSearch {
    async fn search(&self, question: &str) -> Result<Vec<TableMetadata>>;
}

const NAME_SCORE: f32 = 1.0;
const ALIAS_SCORE: f32 = 0.95;
const COLUMN_TERM_SCORE: f32 = 0.6;
const PARTIAL_SCORE: f32 = 0.4;

const NON_DOMAIN_TERMS: &[&str] = &[
    "id", "at", "by", "is", "has", "created", "updated", "deleted", "date", "time", "timestamp",
    "status", "type", "active", "enabled", "version", "seq", "no", "num", "count", "total", "sum",
    "last", "edited", "valid", "from", "to",
];

/// Split CamelCase and snake_case into lowercase words.
fn split_identifier(identifier: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in identifier.chars() {
        if c == '_' || c == ' ' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// First meaningful word of a column name.
fn domain_term(column: &str) -> Option<String> {
    split_identifier(column)
        .into_iter()
        .find(|w| !NON_DOMAIN_TERMS.contains(&w.as_str()))
        .map(|w| normalize(&w))
}

pub struct KeywordSchemaSearch {
    catalog: Arc<SchemaCatalog>,
    max_tables: usize,
}

impl KeywordSchemaSearch {
    pub fn new(catalog: Arc<SchemaCatalog>, max_tables: usize) -> Self {
        Self {
            catalog,
            max_tables,
        }
    }

    pub fn score_table(question: &str, table: &TableMetadata) -> f32 {
        let question_norm = normalize(question);
        let words: HashSet<&str> = question_norm.split_whitespace().collect();
        let padded = format!(" {} ", question_norm);
        let mentions = |phrase: &str| {
            let phrase = normalize(phrase);
            !phrase.is_empty() && padded.contains(&format!(" {} ", phrase))
        };

        let table_words = split_identifier(&table.table).join(" ");
        if mentions(&table_words) || mentions(&table.table) {
            return NAME_SCORE;
        }
        if table.aliases.iter().any(|a| mentions(a)) {
            return ALIAS_SCORE;
        }

        let column_hits = table
            .columns
            .iter()
            .filter_map(|c| domain_term(&c.name))
            .filter(|term| words.contains(term.as_str()))
            .collect::<HashSet<_>>()
            .len();
        if column_hits > 0 {
            return (COLUMN_TERM_SCORE + 0.05 * (column_hits as f32 - 1.0)).min(0.9);
        }

        let table_norm = normalize(&table_words);
        let partial = table_norm
            .split_whitespace()
            .filter(|w| w.len() > 3 && words.contains(w))
            .count();
        if partial > 0 {
            PARTIAL_SCORE
        } else {
            0.0
        }
    }
}

#[async_trait]
impl SchemaSearch for KeywordSchemaSearch {
    async fn search(&self, question: &str) -> Result<Vec<TableMetadata>> {
        let mut scored: Vec<(f32, &TableMetadata)> = self
            .catalog
            .tables()
            .iter()
            .map(|t| (Self::score_table(question, t), t))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_tables);

        debug!(
            "Schema search matched: {:?}",
            scored
                .iter()
                .map(|(s, t)| format!("{} ({:.2})", t.qualified_name(), s))
                .collect::<Vec<_>>()
        );
        Ok(scored.into_iter().map(|(_, t)| t.clone()).collect())
    }
}
