//! Pull a JSON object out of free-form model text.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n(.*?)```").expect("fence pattern"))
}

/// Parse the first JSON object found in `text`.
///
/// Tries, in order: the whole text, each fenced code block, and the span from
/// the first `{` to the last `}`.
pub(crate) fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }

    if let Ok(value @ Value::Object(_)) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    for caps in fence().captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str(body.as_str().trim()) {
                return Ok(value);
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| format!("response is not valid JSON: {}", e)),
        _ => Err("response does not contain a JSON object".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_object() {
        let value = extract_json(r#"{"summary": "ok"}"#).unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn test_fenced_object_with_prose() {
        let text = "Here is the plan:\n```json\n{\"tasks\": []}\n```\nLet me know.";
        assert!(extract_json(text).unwrap()["tasks"].is_array());
    }

    #[test]
    fn test_embedded_object() {
        let text = "Sure! {\"approved\": true, \"summary\": \"fine\"} Hope that helps";
        assert_eq!(extract_json(text).unwrap()["approved"], true);
    }

    #[test]
    fn test_garbage() {
        assert!(extract_json("").is_err());
        assert!(extract_json("I could not do that").is_err());
        assert!(extract_json("{not json}").is_err());
    }
}
