//! Redaction of sensitive fields before anything is logged or persisted

use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const REDACTED: &str = "***REDACTED***";

/// Substrings that mark a body key as sensitive (matched on the lowercased key)
const SENSITIVE_KEY_FRAGMENTS: [&str; 9] = [
    "password",
    "secret",
    "token",
    "api_key",
    "authorization",
    "credit_card",
    "ssn",
    "social_security",
    "bank_account",
];

/// Header names redacted on exact, case-insensitive match
const SENSITIVE_HEADERS: [&str; 5] = ["authorization", "x-api-key", "api-key", "token", "cookie"];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

/// Redact sensitive keys in a JSON object, recursing into nested objects.
///
/// Arrays are passed through untouched, including any objects inside them.
pub fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let cleaned = if is_sensitive_key(key) {
                Value::String(REDACTED.to_string())
            } else if let Value::Object(inner) = value {
                Value::Object(sanitize_map(inner))
            } else {
                value.clone()
            };
            (key.clone(), cleaned)
        })
        .collect()
}

/// [`sanitize_map`] lifted to arbitrary JSON; non-object values are returned as-is
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => other.clone(),
    }
}

pub fn sanitize_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive_header(name) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Same as [`sanitize_map`] but for string-valued query parameters
pub fn sanitize_params(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                (key.clone(), REDACTED.to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_sanitize_nested_map() {
        let input = as_map(json!({"password": "x", "nested": {"token": "y", "ok": "z"}}));
        let output = sanitize_map(&input);
        assert_eq!(
            Value::Object(output),
            json!({"password": "***REDACTED***", "nested": {"token": "***REDACTED***", "ok": "z"}})
        );
    }

    #[test]
    fn test_empty_map_unchanged() {
        let empty = Map::new();
        assert!(sanitize_map(&empty).is_empty());
        assert_eq!(sanitize_value(&Value::Null), Value::Null);
        assert!(sanitize_headers(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_key_match_is_substring_and_case_insensitive() {
        let input = as_map(json!({
            "User_Password_Hash": "a",
            "refresh_token": "b",
            "X_API_KEY": "c",
            "username": "d",
            "amount": 12
        }));
        let output = sanitize_map(&input);
        assert_eq!(output["User_Password_Hash"], json!(REDACTED));
        assert_eq!(output["refresh_token"], json!(REDACTED));
        assert_eq!(output["X_API_KEY"], json!(REDACTED));
        assert_eq!(output["username"], json!("d"));
        assert_eq!(output["amount"], json!(12));
    }

    #[test]
    fn test_lists_are_not_recursed() {
        let input = as_map(json!({"cards": [{"credit_card": "4111"}]}));
        let output = sanitize_map(&input);
        assert_eq!(output["cards"], json!([{"credit_card": "4111"}]));
    }

    #[test]
    fn test_sanitize_headers_exact_match() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        headers.insert("X-API-Key".to_string(), "k".to_string());
        headers.insert("X-Token-Id".to_string(), "keep".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let output = sanitize_headers(&headers);
        assert_eq!(output["Authorization"], REDACTED);
        assert_eq!(output["X-API-Key"], REDACTED);
        assert_eq!(output["X-Token-Id"], "keep");
        assert_eq!(output["Content-Type"], "application/json");
    }

    #[test]
    fn test_sanitize_params() {
        let mut params = BTreeMap::new();
        params.insert("api_key".to_string(), "k".to_string());
        params.insert("city".to_string(), "Oslo".to_string());
        let output = sanitize_params(&params);
        assert_eq!(output["api_key"], REDACTED);
        assert_eq!(output["city"], "Oslo");
    }
}
