use once_cell::sync::Lazy;
use regex::Regex;

static THINK_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<think>[\s\S]*?</think>|<think\s*/>").unwrap());

static REASONING_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<reasoning>[\s\S]*?</reasoning>").unwrap());

static CODE_FENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|sql)?\s*(.*?)\s*```").unwrap());

/// Strips model artifacts around a structured answer: reasoning tags,
/// markdown code fences and any prose before the first `{` / after the last `}`.
pub fn clean_llm_response(response: &str) -> String {
    let mut cleaned = THINK_TAG_PATTERN.replace_all(response, "").to_string();
    cleaned = REASONING_TAG_PATTERN.replace_all(&cleaned, "").to_string();

    if let Some(cap) = CODE_FENCE_PATTERN.captures(&cleaned) {
        cleaned = cap[1].to_string();
    }

    let trimmed = cleaned.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => trimmed[start..=end].to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_think_tags() {
        let input = "<think>Some reasoning here</think>{\"status\":\"error\"}";
        assert_eq!(clean_llm_response(input), "{\"status\":\"error\"}");
    }

    #[test]
    fn test_clean_code_fence() {
        let input = "```json\n{\"status\": \"success\"}\n```";
        assert_eq!(clean_llm_response(input), "{\"status\": \"success\"}");
    }

    #[test]
    fn test_clean_surrounding_prose() {
        let input = "Sure! Here you go: {\"a\": {\"b\": 1}} Hope that helps.";
        assert_eq!(clean_llm_response(input), "{\"a\": {\"b\": 1}}");
    }

    #[test]
    fn test_clean_preserves_plain_text() {
        let input = "  not json at all ";
        assert_eq!(clean_llm_response(input), "not json at all");
    }
}
