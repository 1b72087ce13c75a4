//! Parameter Validator
//!
//! Deterministic, side-effect-free check of one extracted value against its
//! declared rule. Fuzzy resolution happens upstream in the extractor; here
//! allowed values are matched exactly and case-sensitively.

use crate::domain::error::{AppError, Result, ValidationErrorKind};
use crate::domain::parameter::{ParamValue, DATE_FORMAT};
use crate::domain::query_template::{ParamType, ParameterSpec, SpecBound};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub normalized_value: Option<ParamValue>,
    pub error_kind: Option<ValidationErrorKind>,
    pub message: Option<String>,
}

impl ValidationResult {
    fn valid(value: ParamValue) -> Self {
        Self {
            ok: true,
            normalized_value: Some(value),
            error_kind: None,
            message: None,
        }
    }

    fn invalid(kind: ValidationErrorKind, message: String) -> Self {
        Self {
            ok: false,
            normalized_value: None,
            error_kind: Some(kind),
            message: Some(message),
        }
    }

    pub fn into_result(self) -> Result<ParamValue> {
        match (self.normalized_value, self.error_kind) {
            (Some(value), None) => Ok(value),
            (_, kind) => Err(AppError::validation(
                kind.unwrap_or(ValidationErrorKind::TypeError),
                self.message.unwrap_or_default(),
            )),
        }
    }
}

pub struct ParameterValidator;

impl ParameterValidator {
    pub fn validate(spec: &ParameterSpec, value: &str) -> ValidationResult {
        let raw = value.trim();
        if raw.is_empty() {
            return ValidationResult::invalid(
                ValidationErrorKind::TypeError,
                format!("'{}' requires a value", spec.name),
            );
        }

        let result = match spec.param_type {
            ParamType::Integer => Self::validate_integer(spec, raw),
            ParamType::String => Ok(ParamValue::String(raw.to_string())),
            ParamType::Date => Self::validate_date(spec, raw),
        };

        let normalized = match result {
            Ok(v) => v,
            Err(invalid) => return invalid,
        };

        if let Some(allowed) = &spec.allowed_values {
            let rendered = normalized.to_string();
            if !allowed.iter().any(|a| *a == rendered) {
                return ValidationResult::invalid(
                    ValidationErrorKind::AllowedValueError,
                    format!(
                        "'{}' is not an allowed value for '{}'. Allowed: {}",
                        rendered,
                        spec.name,
                        allowed.join(", ")
                    ),
                );
            }
        }

        ValidationResult::valid(normalized)
    }

    /// Load-time check that `min`/`max` fit the parameter type and are ordered.
    pub fn check_bounds(spec: &ParameterSpec) -> Result<()> {
        if spec.min.is_none() && spec.max.is_none() {
            return Ok(());
        }
        let ordered = match spec.param_type {
            ParamType::Integer => {
                let min = spec.min.as_ref().map(|b| integer_bound(spec, b)).transpose()?;
                let max = spec.max.as_ref().map(|b| integer_bound(spec, b)).transpose()?;
                min.zip(max).map_or(true, |(lo, hi)| lo <= hi)
            }
            ParamType::Date => {
                let min = spec.min.as_ref().map(|b| date_bound(spec, b)).transpose()?;
                let max = spec.max.as_ref().map(|b| date_bound(spec, b)).transpose()?;
                min.zip(max).map_or(true, |(lo, hi)| lo <= hi)
            }
            ParamType::String => {
                return Err(AppError::Configuration(format!(
                    "string parameter '{}' cannot declare min/max",
                    spec.name
                )));
            }
        };
        if !ordered {
            return Err(AppError::Configuration(format!(
                "parameter '{}' has min above max",
                spec.name
            )));
        }
        Ok(())
    }

    /// Same as [`validate`](Self::validate) but as a `Result`.
    pub fn check(spec: &ParameterSpec, value: &str) -> Result<ParamValue> {
        Self::validate(spec, value).into_result()
    }

    fn validate_integer(
        spec: &ParameterSpec,
        raw: &str,
    ) -> std::result::Result<ParamValue, ValidationResult> {
        let n: i64 = raw.parse().map_err(|_| {
            ValidationResult::invalid(
                ValidationErrorKind::TypeError,
                format!("'{}' is not a whole number for '{}'", raw, spec.name),
            )
        })?;

        let min = spec
            .min
            .as_ref()
            .map(|b| integer_bound(spec, b))
            .transpose()
            .map_err(|e| unusable_bound(spec, e))?;
        let max = spec
            .max
            .as_ref()
            .map(|b| integer_bound(spec, b))
            .transpose()
            .map_err(|e| unusable_bound(spec, e))?;
        if min.map_or(false, |m| n < m) || max.map_or(false, |m| n > m) {
            return Err(ValidationResult::invalid(
                ValidationErrorKind::RangeError,
                format!(
                    "{} is outside [{}, {}] for '{}'",
                    n,
                    min.map_or("-inf".to_string(), |m| m.to_string()),
                    max.map_or("+inf".to_string(), |m| m.to_string()),
                    spec.name
                ),
            ));
        }

        Ok(ParamValue::Integer(n))
    }

    fn validate_date(
        spec: &ParameterSpec,
        raw: &str,
    ) -> std::result::Result<ParamValue, ValidationResult> {
        let date = NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| {
            ValidationResult::invalid(
                ValidationErrorKind::TypeError,
                format!("'{}' is not a YYYY-MM-DD date for '{}'", raw, spec.name),
            )
        })?;

        let min = spec
            .min
            .as_ref()
            .map(|b| date_bound(spec, b))
            .transpose()
            .map_err(|e| unusable_bound(spec, e))?;
        let max = spec
            .max
            .as_ref()
            .map(|b| date_bound(spec, b))
            .transpose()
            .map_err(|e| unusable_bound(spec, e))?;
        if min.map_or(false, |m| date < m) || max.map_or(false, |m| date > m) {
            return Err(ValidationResult::invalid(
                ValidationErrorKind::RangeError,
                format!("{} is outside the allowed range for '{}'", raw, spec.name),
            ));
        }

        Ok(ParamValue::Date(date))
    }
}

fn integer_bound(spec: &ParameterSpec, bound: &SpecBound) -> Result<i64> {
    match bound {
        SpecBound::Integer(n) => Ok(*n),
        SpecBound::Text(s) => s.trim().parse().map_err(|_| {
            AppError::Configuration(format!(
                "bound '{}' on integer parameter '{}' is not a whole number",
                s, spec.name
            ))
        }),
    }
}

fn date_bound(spec: &ParameterSpec, bound: &SpecBound) -> Result<NaiveDate> {
    match bound {
        SpecBound::Text(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|_| {
            AppError::Configuration(format!(
                "bound '{}' on date parameter '{}' is not YYYY-MM-DD",
                s, spec.name
            ))
        }),
        SpecBound::Integer(n) => Err(AppError::Configuration(format!(
            "bound {} on date parameter '{}' is not a date",
            n, spec.name
        ))),
    }
}

/// A bound that cannot be read rejects every value rather than lifting the range.
fn unusable_bound(spec: &ParameterSpec, err: AppError) -> ValidationResult {
    error!("Parameter '{}' has an unusable bound: {}", spec.name, err);
    ValidationResult::invalid(
        ValidationErrorKind::RangeError,
        format!("'{}' has no usable range", spec.name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(param_type: ParamType) -> ParameterSpec {
        ParameterSpec {
            name: "p".to_string(),
            param_type,
            description: None,
            min: None,
            max: None,
            allowed_values: None,
            synonyms: BTreeMap::new(),
            default_value: None,
            ask_if_missing: true,
        }
    }

    fn bounded_integer() -> ParameterSpec {
        ParameterSpec {
            min: Some(SpecBound::Integer(1)),
            max: Some(SpecBound::Integer(100)),
            ..spec(ParamType::Integer)
        }
    }

    #[test]
    fn test_integer_boundaries_are_inclusive() {
        let s = bounded_integer();
        assert!(ParameterValidator::validate(&s, "1").ok);
        assert!(ParameterValidator::validate(&s, "100").ok);
        assert_eq!(
            ParameterValidator::validate(&s, "0").error_kind,
            Some(ValidationErrorKind::RangeError)
        );
        assert_eq!(
            ParameterValidator::validate(&s, "101").error_kind,
            Some(ValidationErrorKind::RangeError)
        );
    }

    #[test]
    fn test_integer_rejects_non_numeric() {
        let s = bounded_integer();
        for raw in ["five", "5.5", "", "1e2"] {
            let result = ParameterValidator::validate(&s, raw);
            assert!(!result.ok, "{} should be rejected", raw);
            assert_eq!(result.error_kind, Some(ValidationErrorKind::TypeError));
        }
    }

    #[test]
    fn test_integer_normalizes_whitespace() {
        let result = ParameterValidator::validate(&bounded_integer(), " 42 ");
        assert_eq!(result.normalized_value, Some(ParamValue::Integer(42)));
    }

    #[test]
    fn test_allowed_values_are_case_sensitive() {
        let s = ParameterSpec {
            allowed_values: Some(vec!["ASC".into(), "DESC".into()]),
            ..spec(ParamType::String)
        };
        assert!(ParameterValidator::validate(&s, "DESC").ok);
        for raw in ["desc", "Desc", "DESCENDING"] {
            assert_eq!(
                ParameterValidator::validate(&s, raw).error_kind,
                Some(ValidationErrorKind::AllowedValueError)
            );
        }
    }

    #[test]
    fn test_date_format_and_range() {
        let s = ParameterSpec {
            min: Some(SpecBound::Text("2013-01-01".into())),
            max: Some(SpecBound::Text("2016-05-31".into())),
            ..spec(ParamType::Date)
        };
        assert_eq!(
            ParameterValidator::validate(&s, "2016-05-31").normalized_value,
            Some(ParamValue::Date(NaiveDate::from_ymd_opt(2016, 5, 31).unwrap()))
        );
        assert_eq!(
            ParameterValidator::validate(&s, "2012-12-31").error_kind,
            Some(ValidationErrorKind::RangeError)
        );
        assert_eq!(
            ParameterValidator::validate(&s, "31/05/2016").error_kind,
            Some(ValidationErrorKind::TypeError)
        );
    }

    #[test]
    fn test_check_maps_to_app_error() {
        let err = ParameterValidator::check(&bounded_integer(), "500").unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation {
                kind: ValidationErrorKind::RangeError,
                ..
            }
        ));
    }

    #[test]
    fn test_unreadable_bound_rejects_instead_of_skipping() {
        let spec = ParameterSpec {
            min: Some(SpecBound::Text("2016/01/01".into())),
            ..spec(ParamType::Date)
        };
        let result = ParameterValidator::validate(&spec, "2016-02-01");
        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ValidationErrorKind::RangeError));
        assert!(matches!(
            ParameterValidator::check_bounds(&spec),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_check_bounds() {
        assert!(ParameterValidator::check_bounds(&bounded_integer()).is_ok());
        let text_on_integer = ParameterSpec {
            max: Some(SpecBound::Text("lots".into())),
            ..spec(ParamType::Integer)
        };
        assert!(ParameterValidator::check_bounds(&text_on_integer).is_err());
        let integer_on_date = ParameterSpec {
            min: Some(SpecBound::Integer(2016)),
            ..spec(ParamType::Date)
        };
        assert!(ParameterValidator::check_bounds(&integer_on_date).is_err());
        let inverted = ParameterSpec {
            min: Some(SpecBound::Integer(10)),
            max: Some(SpecBound::Integer(1)),
            ..spec(ParamType::Integer)
        };
        assert!(ParameterValidator::check_bounds(&inverted).is_err());
    }
}
