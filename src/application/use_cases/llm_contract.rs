//! Strict parsing of LLM replies.
//!
//! Every structured reply carries a `status` of `success`, `needs_clarification`
//! or `error`. Anything else, including transport failures and timeouts, is
//! folded into [`LlmOutcome::Error`] so callers only ever match three shapes.

use crate::domain::error::Result;
use crate::domain::llm_config::LLMConfig;
use crate::infrastructure::llm_clients::LLMClient;
use crate::infrastructure::response::clean_llm_response;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LlmOutcome<T> {
    Success(T),
    NeedsClarification {
        question: String,
        best_guess: Option<String>,
        options: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl<T> LlmOutcome<T> {
    pub fn error(message: impl Into<String>) -> Self {
        LlmOutcome::Error {
            message: message.into(),
        }
    }

    pub fn success(self) -> Option<T> {
        match self {
            LlmOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClarificationBody {
    #[serde(default, alias = "message")]
    question: Option<String>,
    #[serde(default)]
    best_guess: Option<Value>,
    #[serde(default, alias = "alternatives")]
    options: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// Render a JSON scalar the way a user would type it.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse an already-received reply.
pub fn parse_llm_outcome<T: DeserializeOwned>(raw: &str) -> LlmOutcome<T> {
    let cleaned = clean_llm_response(raw);
    let value: Value = match serde_json::from_str(&cleaned) {
        Ok(v) => v,
        Err(e) => return LlmOutcome::error(format!("reply is not JSON: {}", e)),
    };

    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase());

    match status.as_deref() {
        Some("success") => match serde_json::from_value::<T>(value) {
            Ok(body) => LlmOutcome::Success(body),
            Err(e) => LlmOutcome::error(format!("success reply has wrong shape: {}", e)),
        },
        Some("needs_clarification") => match serde_json::from_value::<ClarificationBody>(value) {
            Ok(body) => LlmOutcome::NeedsClarification {
                question: body.question.unwrap_or_default(),
                best_guess: body.best_guess.as_ref().and_then(scalar_to_string),
                options: body.options.iter().filter_map(scalar_to_string).collect(),
            },
            Err(e) => LlmOutcome::error(format!("clarification reply has wrong shape: {}", e)),
        },
        Some("error") => {
            let message = serde_json::from_value::<ErrorBody>(value)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| "model reported an error".to_string());
            LlmOutcome::error(message)
        }
        Some(other) => LlmOutcome::error(format!("unknown status '{}'", other)),
        None => LlmOutcome::error("reply has no status"),
    }
}

/// Fold a transport result into the contract.
pub fn outcome_from_reply<T: DeserializeOwned>(reply: Result<String>) -> LlmOutcome<T> {
    match reply {
        Ok(raw) => parse_llm_outcome(&raw),
        Err(e) => LlmOutcome::error(e.to_string()),
    }
}

/// One bounded round-trip to the model.
pub async fn ask_llm<T: DeserializeOwned>(
    client: &(dyn LLMClient + Send + Sync),
    config: &LLMConfig,
    system: &str,
    user: &str,
) -> LlmOutcome<T> {
    let limit = Duration::from_secs(config.timeout_secs.max(1));
    let reply = match timeout(limit, client.generate(config, system, user)).await {
        Ok(reply) => reply,
        Err(_) => {
            warn!("LLM call timed out after {}s", limit.as_secs());
            return LlmOutcome::error(format!("timed out after {}s", limit.as_secs()));
        }
    };
    let outcome = outcome_from_reply(reply);
    if let LlmOutcome::Error { message } = &outcome {
        debug!("LLM reply treated as error: {}", message);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::AppError;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Value1 {
        value: String,
        confidence: f32,
    }

    #[test]
    fn test_success_in_code_fence() {
        let raw = "```json\n{\"status\": \"success\", \"value\": \"DESC\", \"confidence\": 0.9}\n```";
        assert_eq!(
            parse_llm_outcome::<Value1>(raw),
            LlmOutcome::Success(Value1 {
                value: "DESC".into(),
                confidence: 0.9
            })
        );
    }

    #[test]
    fn test_needs_clarification_with_numeric_options() {
        let raw = r#"{"status":"needs_clarification","question":"How many?","options":[5, 10, "20"]}"#;
        match parse_llm_outcome::<Value1>(raw) {
            LlmOutcome::NeedsClarification { question, options, best_guess } => {
                assert_eq!(question, "How many?");
                assert_eq!(options, vec!["5", "10", "20"]);
                assert_eq!(best_guess, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_shapes_become_error() {
        for raw in [
            "I think the answer is DESC",
            r#"{"value": "DESC"}"#,
            r#"{"status": "maybe"}"#,
            r#"{"status": "success", "confidence": 0.4}"#,
        ] {
            assert!(
                matches!(parse_llm_outcome::<Value1>(raw), LlmOutcome::Error { .. }),
                "{} should be an error",
                raw
            );
        }
    }

    #[test]
    fn test_transport_error_becomes_error() {
        let outcome: LlmOutcome<Value1> =
            outcome_from_reply(Err(AppError::LLMError("connection refused".into())));
        assert!(matches!(outcome, LlmOutcome::Error { message } if message.contains("refused")));
    }
}
