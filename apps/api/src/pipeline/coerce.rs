//! Tolerant parsing of LLM JSON output.
//!
//! Models drift on shape: capitalized keys, a bare array instead of a wrapped
//! object, fenced output. Rather than optional-chaining through the
//! orchestrators, every tolerated variant is handled here with a defined
//! fallback order, as pure functions with a test per known variant.

use serde_json::Value;
use thiserror::Error;

use crate::llm_client::strip_json_fences;

#[derive(Debug, Error)]
pub enum CoerceError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected shape: {0}")]
    Shape(String),
}

/// Parses raw LLM text into a JSON value, stripping markdown fences first.
pub fn parse_llm_json(text: &str) -> Result<Value, CoerceError> {
    Ok(serde_json::from_str(strip_json_fences(text))?)
}

/// Extracts the array expected under `key`. Fallback order:
/// 1. the exact key;
/// 2. the key with its first letter capitalized;
/// 3. a case-insensitive key scan;
/// 4. the value itself, if the model skipped the wrapper object;
/// 5. otherwise, a shape error.
pub fn coerce_array(value: &Value, key: &str) -> Result<Vec<Value>, CoerceError> {
    if let Some(items) = value.get(key).and_then(Value::as_array) {
        return Ok(items.clone());
    }

    if let Some(items) = value.get(capitalize(key)).and_then(Value::as_array) {
        return Ok(items.clone());
    }

    if let Some(obj) = value.as_object() {
        for (k, v) in obj {
            if k.eq_ignore_ascii_case(key) {
                if let Some(items) = v.as_array() {
                    return Ok(items.clone());
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        return Ok(items.clone());
    }

    Err(CoerceError::Shape(format!(
        "expected an array under '{key}', got: {}",
        shape_of(value)
    )))
}

/// Recursively lowercases the first character of every object key.
/// Used as the last-resort remap before a schema validation gives up.
pub fn lowercase_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (decapitalize(k), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_keys).collect()),
        other => other.clone(),
    }
}

/// Case-insensitive string field lookup on an object.
pub fn get_str_ci<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    let obj = value.as_object()?;
    if let Some(s) = obj.get(key).and_then(Value::as_str) {
        return Some(s);
    }
    obj.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, v)| v.as_str())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn decapitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_key() {
        let v = json!({"evidence": [{"quote": "a"}]});
        assert_eq!(coerce_array(&v, "evidence").unwrap().len(), 1);
    }

    #[test]
    fn test_capitalized_key_variant() {
        let v = json!({"Evidence": [{"quote": "a"}, {"quote": "b"}]});
        assert_eq!(coerce_array(&v, "evidence").unwrap().len(), 2);
    }

    #[test]
    fn test_uppercase_key_variant_via_ci_scan() {
        let v = json!({"EVIDENCE": [{"quote": "a"}]});
        assert_eq!(coerce_array(&v, "evidence").unwrap().len(), 1);
    }

    #[test]
    fn test_bare_array_variant() {
        let v = json!([{"quote": "a"}]);
        assert_eq!(coerce_array(&v, "evidence").unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_shape_is_an_error() {
        let v = json!({"evidence": "none"});
        assert!(coerce_array(&v, "evidence").is_err());
        let v = json!("just text");
        assert!(coerce_array(&v, "evidence").is_err());
    }

    #[test]
    fn test_exact_key_wins_over_capitalized() {
        let v = json!({"evidence": [{"quote": "right"}], "Evidence": [{"quote": "wrong"}]});
        let items = coerce_array(&v, "evidence").unwrap();
        assert_eq!(items[0]["quote"], "right");
    }

    #[test]
    fn test_parse_llm_json_strips_fences() {
        let v = parse_llm_json("```json\n{\"evidence\": []}\n```").unwrap();
        assert!(v.get("evidence").is_some());
    }

    #[test]
    fn test_lowercase_keys_recurses() {
        let v = json!({"Overview": "x", "Strengths": ["a"], "Nested": {"Inner": 1}});
        let remapped = lowercase_keys(&v);
        assert_eq!(remapped["overview"], "x");
        assert_eq!(remapped["nested"]["inner"], 1);
    }

    #[test]
    fn test_get_str_ci_prefers_exact_match() {
        let v = json!({"quote": "exact", "Quote": "cap"});
        assert_eq!(get_str_ci(&v, "quote"), Some("exact"));
        let v = json!({"Quote": "cap"});
        assert_eq!(get_str_ci(&v, "quote"), Some("cap"));
        assert_eq!(get_str_ci(&v, "reasoning"), None);
    }
}
