use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a single parameter value was rejected by the parameter validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    TypeError,
    RangeError,
    AllowedValueError,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorKind::TypeError => write!(f, "TypeError"),
            ValidationErrorKind::RangeError => write!(f, "RangeError"),
            ValidationErrorKind::AllowedValueError => write!(f, "AllowedValueError"),
        }
    }
}

/// Why the final SQL gate refused a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryRejection {
    Empty,
    Malformed,
    MultipleStatements,
    NotSelect,
    ForbiddenKeyword(String),
    CommentNotAllowed,
    UnsubstitutedToken,
    TableNotAllowed(String),
}

impl fmt::Display for QueryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryRejection::Empty => write!(f, "empty statement"),
            QueryRejection::Malformed => write!(f, "malformed statement"),
            QueryRejection::MultipleStatements => write!(f, "multiple statements"),
            QueryRejection::NotSelect => write!(f, "statement is not a SELECT"),
            QueryRejection::ForbiddenKeyword(k) => write!(f, "forbidden keyword {}", k),
            QueryRejection::CommentNotAllowed => write!(f, "comments are not allowed"),
            QueryRejection::UnsubstitutedToken => write!(f, "unsubstituted template token"),
            QueryRejection::TableNotAllowed(t) => write!(f, "table {} is not allowlisted", t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    Timeout,
    Connection,
    Schema,
    Other,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum AppError {
    Internal(String),
    NotFound(String),
    Configuration(String),
    Validation {
        kind: ValidationErrorKind,
        message: String,
    },
    UnsafeStatement(QueryRejection),
    Execution {
        kind: ExecutionErrorKind,
        message: String,
        suggestions: Vec<String>,
    },
    ClarificationExhausted(String),
    NoMatchingQuery(String),
    ParseError(String),
    LLMError(String),
    IoError(String),
}

impl AppError {
    pub fn validation(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        AppError::Validation {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        AppError::Execution {
            kind,
            message: message.into(),
            suggestions: Vec::new(),
        }
    }

    /// Terminal errors end the turn and are surfaced to the caller as failures.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppError::Validation { .. })
    }

    /// Short machine-readable tag used by the HTTP surface.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal",
            AppError::NotFound(_) => "not_found",
            AppError::Configuration(_) => "configuration_error",
            AppError::Validation { .. } => "validation_error",
            AppError::UnsafeStatement(_) => "unsafe_statement",
            AppError::Execution { kind, .. } => match kind {
                ExecutionErrorKind::Timeout => "timeout_error",
                ExecutionErrorKind::Connection => "connection_error",
                ExecutionErrorKind::Schema => "schema_error",
                ExecutionErrorKind::Other => "execution_error",
            },
            AppError::ClarificationExhausted(_) => "clarification_exhausted",
            AppError::NoMatchingQuery(_) => "no_matching_query",
            AppError::ParseError(_) => "parse_error",
            AppError::LLMError(_) => "llm_error",
            AppError::IoError(_) => "io_error",
        }
    }

    /// Message safe to show an end user. Never includes SQL or driver output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::UnsafeStatement(_) => {
                "The generated query was rejected by the safety checks.".to_string()
            }
            AppError::Execution { kind, suggestions, .. } => {
                let base = match kind {
                    ExecutionErrorKind::Timeout => "The query took too long and was stopped.",
                    ExecutionErrorKind::Connection => "The database is currently unreachable.",
                    ExecutionErrorKind::Schema | ExecutionErrorKind::Other => {
                        "The query could not be run against the database."
                    }
                };
                if suggestions.is_empty() {
                    base.to_string()
                } else {
                    format!("{} Related tables: {}.", base, suggestions.join(", "))
                }
            }
            AppError::Configuration(_) | AppError::Internal(_) | AppError::IoError(_) => {
                "The query service is misconfigured. Operators have been notified.".to_string()
            }
            AppError::ClarificationExhausted(_) => {
                "Unable to determine the query after several clarifications. Please rephrase the question."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Validation { kind, message } => {
                write!(f, "Validation error ({}): {}", kind, message)
            }
            AppError::UnsafeStatement(reason) => write!(f, "Unsafe statement: {}", reason),
            AppError::Execution { kind, message, .. } => {
                write!(f, "Execution error ({:?}): {}", kind, message)
            }
            AppError::ClarificationExhausted(msg) => {
                write!(f, "Unable to determine query: {}", msg)
            }
            AppError::NoMatchingQuery(msg) => write!(f, "No matching query: {}", msg),
            AppError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            AppError::LLMError(msg) => write!(f, "LLM error: {}", msg),
            AppError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
