use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Free-form correlation tags supplied by the calling context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTags {
    pub account_id: Option<String>,
    pub partner_journey_id: Option<String>,
    pub application_id: Option<String>,
    pub user_id: Option<String>,
}

/// One row per inbound HTTP request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRequestLog {
    pub request_id: String,
    pub correlation_id: String,

    pub method: String,
    pub path: String,
    pub url: String,
    pub query_params: BTreeMap<String, String>,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<Value>,
    pub request_body_size: usize,

    pub status_code: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<Value>,
    pub response_body_size: usize,

    pub execution_time_ms: f64,

    pub client_ip: Option<String>,
    pub user_agent: Option<String>,

    #[serde(flatten)]
    pub tags: LogTags,

    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// One row per outbound call attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundCallLog {
    pub call_id: String,
    pub correlation_id: String,
    pub parent_request_id: Option<String>,

    pub vendor: String,
    pub method: String,
    pub endpoint: String,
    pub url: String,

    pub request_body: Option<Value>,
    pub request_params: BTreeMap<String, String>,
    pub request_headers: BTreeMap<String, String>,

    pub status_code: Option<u16>,
    pub response_body: Option<Value>,
    pub response_headers: BTreeMap<String, String>,

    pub execution_time_ms: f64,

    #[serde(flatten)]
    pub tags: LogTags,

    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub circuit_breaker_open: bool,
    pub fallback_used: bool,

    pub timestamp: DateTime<Utc>,
}

impl OutboundCallLog {
    /// "SUCCESS" when a response came back and no error was recorded
    pub fn status(&self) -> &'static str {
        if self.error_type.is_none() && self.status_code.is_some() {
            "SUCCESS"
        } else {
            "FAILURE"
        }
    }
}

/// Decode a captured body: JSON when it parses, `{"raw_content": text}` otherwise,
/// `None` when empty.
pub fn decode_body(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Some(value),
        Err(_) => Some(json!({ "raw_content": String::from_utf8_lossy(bytes) })),
    }
}

/// Like [`decode_body`] but an empty body becomes `{}`
pub fn decode_response_body(bytes: &[u8]) -> Value {
    decode_body(bytes).unwrap_or_else(|| json!({}))
}

/// Milliseconds rounded to two decimals
pub fn elapsed_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
    }
}

/// Serialize an optional JSON body to text for relational columns
pub fn body_to_text(body: &Option<Value>) -> Option<String> {
    body.as_ref().map(|value| value.to_string())
}

pub fn map_to_text(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

pub fn text_to_map(text: Option<String>) -> BTreeMap<String, String> {
    text.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn text_to_body(text: Option<String>) -> Option<Value> {
    text.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn inbound(request_id: &str) -> InboundRequestLog {
        InboundRequestLog {
            request_id: request_id.to_string(),
            correlation_id: format!("corr-{}", request_id),
            method: "GET".to_string(),
            path: "/items".to_string(),
            url: "http://localhost/items?skip=0".to_string(),
            query_params: BTreeMap::from([("skip".to_string(), "0".to_string())]),
            request_headers: BTreeMap::from([("accept".to_string(), "*/*".to_string())]),
            request_body: None,
            request_body_size: 0,
            status_code: 200,
            response_headers: BTreeMap::new(),
            response_body: Some(json!({"items": []})),
            response_body_size: 12,
            execution_time_ms: 1.25,
            client_ip: Some("10.0.0.1".to_string()),
            user_agent: Some("test-agent".to_string()),
            tags: LogTags::default(),
            error_message: None,
            error_type: None,
            timestamp: Utc::now(),
        }
    }

    pub fn outbound(call_id: &str, vendor: &str) -> OutboundCallLog {
        OutboundCallLog {
            call_id: call_id.to_string(),
            correlation_id: "corr-1".to_string(),
            parent_request_id: Some("req-1".to_string()),
            vendor: vendor.to_string(),
            method: "GET".to_string(),
            endpoint: "/forecast".to_string(),
            url: "https://weather.example.com/forecast".to_string(),
            request_body: None,
            request_params: BTreeMap::new(),
            request_headers: BTreeMap::new(),
            status_code: Some(200),
            response_body: Some(json!({"temp": 21})),
            response_headers: BTreeMap::new(),
            execution_time_ms: 12.5,
            tags: LogTags::default(),
            error_message: None,
            error_type: None,
            circuit_breaker_open: false,
            fallback_used: false,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), None);
        assert_eq!(decode_body(br#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            decode_body(b"plain text"),
            Some(json!({"raw_content": "plain text"}))
        );
        assert_eq!(decode_response_body(b""), json!({}));
    }

    #[test]
    fn test_elapsed_ms_rounding() {
        assert_eq!(elapsed_ms(Duration::from_micros(1234)), 1.23);
        assert_eq!(elapsed_ms(Duration::from_micros(1236)), 1.24);
        assert_eq!(elapsed_ms(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(1500);
        assert_eq!(truncate_message(&long).len(), 1000);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn test_call_status() {
        let mut log = fixtures::outbound("c1", "weather");
        assert_eq!(log.status(), "SUCCESS");
        log.error_type = Some("Timeout".to_string());
        assert_eq!(log.status(), "FAILURE");
    }

    #[test]
    fn test_text_helpers() {
        let map = BTreeMap::from([("a".to_string(), "b".to_string())]);
        assert_eq!(text_to_map(Some(map_to_text(&map))), map);
        assert_eq!(text_to_map(None), BTreeMap::new());
        assert_eq!(text_to_body(Some("{\"x\":1}".to_string())), Some(json!({"x": 1})));
        assert_eq!(text_to_body(Some("raw".to_string())), Some(json!("raw")));
    }

    #[test]
    fn test_tags_flatten_into_document() {
        let mut log = fixtures::outbound("c1", "weather");
        log.tags.account_id = Some("acct-9".to_string());
        let doc = serde_json::to_value(&log).unwrap();
        assert_eq!(doc["account_id"], json!("acct-9"));
        assert_eq!(doc["vendor"], json!("weather"));
    }
}
