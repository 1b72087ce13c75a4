//! Literal token substitution for template SQL.
//!
//! Tokens are `%{{name}}%`. Templates quote their own string tokens
//! (`WHERE Category = '%{{category}}%'`); values only need quote escaping.

use crate::domain::error::{AppError, Result};
use crate::domain::parameter::{ExtractedParameter, ParamValue, DATE_FORMAT};
use crate::domain::query_template::{QueryTemplate, TOKEN_OPEN, TOKEN_PATTERN};
use crate::domain::resolved_query::{QuerySource, ResolvedQuery};
use regex::Captures;

pub fn render_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Integer(n) => n.to_string(),
        ParamValue::String(s) => s.replace('\'', "''"),
        ParamValue::Date(d) => d.format(DATE_FORMAT).to_string(),
    }
}

/// Substitute every token. A token with no resolved value is a template
/// bug, reported as a configuration error rather than left in place.
pub fn substitute(sql: &str, params: &[ExtractedParameter]) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();
    let rendered = TOKEN_PATTERN.replace_all(sql, |caps: &Captures| {
        let name = &caps[1];
        match params.iter().find(|p| p.name == name) {
            Some(p) => render_value(&p.value),
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    if !missing.is_empty() {
        return Err(AppError::Configuration(format!(
            "no value for token(s): {}",
            missing.join(", ")
        )));
    }
    if rendered.contains(TOKEN_OPEN) {
        return Err(AppError::Configuration(
            "malformed token left after substitution".to_string(),
        ));
    }
    Ok(rendered.into_owned())
}

pub fn resolve_template(
    template: &QueryTemplate,
    params: &[ExtractedParameter],
    confidence: f32,
) -> Result<ResolvedQuery> {
    Ok(ResolvedQuery {
        sql: substitute(&template.sql, params)?,
        source: QuerySource::Template,
        confidence,
        tables: template.tables_used.clone(),
        template_id: Some(template.id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::parameter::ParamSource;
    use chrono::NaiveDate;

    fn param(name: &str, value: ParamValue) -> ExtractedParameter {
        ExtractedParameter {
            name: name.to_string(),
            value,
            source: ParamSource::Default,
            confidence: 0.7,
            alternatives: vec![],
        }
    }

    #[test]
    fn test_substitutes_every_occurrence() {
        let sql = "SELECT TOP %{{top_n}}% x FROM t WHERE d >= '%{{start}}%' AND c = '%{{cat}}%' OR c2 = '%{{cat}}%'";
        let out = substitute(
            sql,
            &[
                param("top_n", ParamValue::Integer(5)),
                param("start", ParamValue::Date(NaiveDate::from_ymd_opt(2016, 1, 2).unwrap())),
                param("cat", ParamValue::String("Kids' Toys".into())),
            ],
        )
        .unwrap();
        assert_eq!(
            out,
            "SELECT TOP 5 x FROM t WHERE d >= '2016-01-02' AND c = 'Kids'' Toys' OR c2 = 'Kids'' Toys'"
        );
        assert!(!out.contains(TOKEN_OPEN));
    }

    #[test]
    fn test_missing_value_fails_loudly() {
        let err = substitute("SELECT %{{a}}%, %{{b}}%", &[param("a", ParamValue::Integer(1))]).unwrap_err();
        assert!(matches!(err, AppError::Configuration(msg) if msg.contains('b')));
    }

    #[test]
    fn test_broken_token_is_not_passed_through() {
        assert!(substitute("SELECT %{{ 1bad }}%", &[]).is_err());
    }
}
