//! Inbound request logging layer
//!
//! Mounted with [`axum::middleware::from_fn_with_state`]. For every request it
//! resolves the correlation id, buffers and replays the request body, runs the
//! handler inside a correlation scope, captures and rebuilds the response body,
//! stamps the id and timing headers, and commits exactly one
//! [`InboundRequestLog`] row.

use crate::config::LoggingConfig;
use crate::correlation::{self, REQUEST_ID_HEADER};
use crate::error::HandlerError;
use crate::registry::LogRegistry;
use crate::sanitize::{sanitize_headers, sanitize_value};
use crate::storage::models::{decode_body, elapsed_ms, truncate_message};
use crate::storage::{DirectWriter, InboundRequestLog, LogTags};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, response::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde_json::json;
use std::any::Any;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Headers dropped from the persisted row before sanitization
const EXCLUDED_REQUEST_HEADERS: [&str; 2] = ["authorization", "cookie"];

pub const RESPONSE_TIME_HEADER: &str = "X-Response-Time";

/// Per-request state bag handlers can pull out with `Extension<RequestState>`
#[derive(Debug, Clone)]
pub struct RequestState {
    pub request_id: String,
    pub correlation_id: String,
    pub started_at: Instant,
    tags: Arc<Mutex<LogTags>>,
}

impl RequestState {
    fn new(request_id: String, correlation_id: String, started_at: Instant) -> Self {
        Self {
            request_id,
            correlation_id,
            started_at,
            tags: Arc::new(Mutex::new(LogTags::default())),
        }
    }

    /// Set context tags that end up on this request's row
    pub fn tag(&self, update: impl FnOnce(&mut LogTags)) {
        let mut tags = self.tags.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut tags);
    }

    pub fn tags(&self) -> LogTags {
        self.tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub struct RequestLoggingState {
    pub config: LoggingConfig,
    pub max_body_bytes: usize,
    pub direct: Option<DirectWriter>,
    pub registry: Arc<LogRegistry>,
}

impl RequestLoggingState {
    pub fn new(config: LoggingConfig, direct: Option<DirectWriter>, registry: Arc<LogRegistry>) -> Self {
        Self {
            config,
            max_body_bytes: usize::MAX,
            direct,
            registry,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Commit one row: the preferred path first, the other only when it fails.
    async fn commit(&self, log: &InboundRequestLog) -> bool {
        let direct_first = self.config.direct_write_first;
        let first = if direct_first {
            self.write_direct(log).await
        } else {
            self.registry.log_request(log).await
        };
        if first {
            return true;
        }

        let second = if direct_first {
            self.registry.log_request(log).await
        } else {
            self.write_direct(log).await
        };
        if !second {
            tracing::warn!(
                request_id = %log.request_id,
                "Both direct write and registry failed, request row lost"
            );
        }
        second
    }

    async fn write_direct(&self, log: &InboundRequestLog) -> bool {
        match &self.direct {
            Some(writer) => writer.write(log).await,
            None => false,
        }
    }
}

struct Captured {
    parts: Parts,
    body: Bytes,
    /// Error that ended the body stream early, replayed after `body`
    stream_error: Option<axum::Error>,
    error: Option<HandlerError>,
}

pub async fn request_logging_middleware(
    State(state): State<Arc<RequestLoggingState>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = correlation::generate();
    let correlation_id = if state.config.enable_correlation {
        correlation::from_headers(req.headers(), &state.config.correlation_header)
            .unwrap_or_else(|| request_id.clone())
    } else {
        request_id.clone()
    };
    let bound = state
        .config
        .enable_correlation
        .then(|| correlation_id.clone());

    correlation::scope(bound, Some(request_id.clone()), async move {
        let response = handle(state, req, next, request_id, correlation_id, started).await;
        correlation::clear();
        response
    })
    .await
}

async fn handle(
    state: Arc<RequestLoggingState>,
    req: Request,
    next: Next,
    request_id: String,
    correlation_id: String,
    started: Instant,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let url = full_url(&parts.headers, &parts.uri);
    let query_params = parse_query(parts.uri.query());
    let request_headers = capture_request_headers(&parts.headers);
    let client_ip = client_ip(
        &parts.headers,
        parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|c| c.0),
    );
    let user_agent = header_str(&parts.headers, header::USER_AGENT.as_str());

    let request_state = RequestState::new(request_id.clone(), correlation_id.clone(), started);
    parts.extensions.insert(request_state.clone());

    let mut panic_payload: Option<Box<dyn Any + Send>> = None;
    let (request_body, request_body_size, captured) =
        match axum::body::to_bytes(body, state.max_body_bytes).await {
            Ok(bytes) => {
                let req = Request::from_parts(parts, Body::from(bytes.clone()));
                let captured = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                    Ok(response) => capture_response(response).await,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(
                            request_id = %request_id,
                            error = %message,
                            "Handler panicked"
                        );
                        panic_payload = Some(payload);
                        synthetic_failure(&correlation_id, message).await
                    }
                };
                (decode_sanitized(&bytes), bytes.len(), captured)
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to read request body");
                let response = (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({"detail": "Request body could not be read"})),
                )
                    .into_response();
                let mut captured = capture_response(response).await;
                captured.error = Some(HandlerError {
                    error_type: "BodyReadError".to_string(),
                    message: e.to_string(),
                });
                (None, 0, captured)
            }
        };

    let execution_time_ms = elapsed_ms(started.elapsed());
    let response_headers = sanitize_headers(&header_map_to_btree(&captured.parts.headers));
    let stream_failure = captured.stream_error.as_ref().map(|e| HandlerError {
        error_type: "ResponseStreamError".to_string(),
        message: e.to_string(),
    });
    let error = captured.error.as_ref().or(stream_failure.as_ref());

    let log = InboundRequestLog {
        request_id: request_id.clone(),
        correlation_id: correlation_id.clone(),
        method: method.clone(),
        path,
        url,
        query_params,
        request_headers,
        request_body,
        request_body_size,
        status_code: captured.parts.status.as_u16(),
        response_headers,
        response_body: decode_sanitized(&captured.body),
        response_body_size: captured.body.len(),
        execution_time_ms,
        client_ip,
        user_agent,
        tags: request_state.tags(),
        error_message: error.map(|e| truncate_message(&e.message)),
        error_type: error.map(|e| e.error_type.clone()),
        timestamp: Utc::now(),
    };

    crate::metrics::record_inbound(&method, log.status_code);
    let writer = state.clone();
    state.registry.detach(async move {
        writer.commit(&log).await;
        tracing::debug!(
            request_id = %log.request_id,
            status = log.status_code,
            execution_time_ms = log.execution_time_ms,
            "Inbound request logged"
        );
    });

    if let Some(payload) = panic_payload {
        std::panic::resume_unwind(payload);
    }

    let mut response = rebuild_response(captured);
    stamp_headers(
        response.headers_mut(),
        &state.config,
        &request_id,
        &correlation_id,
        execution_time_ms,
    );
    response
}

/// Drain the response body chunk by chunk
async fn capture_response(response: Response) -> Captured {
    let error = response.extensions().get::<HandlerError>().cloned();
    let (parts, body) = response.into_parts();

    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    let mut stream_error = None;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => buffer.extend_from_slice(&chunk),
            Err(e) => {
                tracing::warn!(error = %e, "Response body stream failed, logging partial body");
                stream_error = Some(e);
                break;
            }
        }
    }

    Captured {
        parts,
        body: Bytes::from(buffer),
        stream_error,
        error,
    }
}

async fn synthetic_failure(correlation_id: &str, message: String) -> Captured {
    let response = (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "detail": "Internal Server Error",
            "correlation_id": correlation_id,
        })),
    )
        .into_response();
    let mut captured = capture_response(response).await;
    captured.error = Some(HandlerError {
        error_type: "panic".to_string(),
        message,
    });
    captured
}

/// Rebuild a response carrying exactly the captured bytes, then the stream
/// error if the original body ended with one
fn rebuild_response(captured: Captured) -> Response {
    let Captured {
        mut parts,
        body,
        stream_error,
        error,
    } = captured;
    let mut chunks: Vec<Result<Bytes, axum::Error>> = vec![Ok(body)];
    chunks.extend(stream_error.map(Err));
    if let Some(error) = error {
        parts.extensions.insert(error);
    }
    Response::from_parts(parts, Body::from_stream(futures::stream::iter(chunks)))
}

fn stamp_headers(
    headers: &mut HeaderMap,
    config: &LoggingConfig,
    request_id: &str,
    correlation_id: &str,
    execution_time_ms: f64,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{execution_time_ms:.2}ms")) {
        headers.insert(RESPONSE_TIME_HEADER, value);
    }
    if config.enable_correlation {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(config.correlation_header.as_bytes()),
            HeaderValue::from_str(correlation_id),
        ) {
            headers.insert(name, value);
        }
    }
}

fn decode_sanitized(bytes: &[u8]) -> Option<serde_json::Value> {
    decode_body(bytes).map(|body| sanitize_value(&body))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Lower-cased names; repeated headers are joined with ", "
fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn capture_request_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured = header_map_to_btree(headers);
    captured.retain(|name, _| !EXCLUDED_REQUEST_HEADERS.contains(&name.as_str()));
    sanitize_headers(&captured)
}

pub fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn full_url(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    match header_str(headers, header::HOST.as_str()) {
        Some(host) => format!("http://{host}{path_and_query}"),
        None => path_and_query.to_string(),
    }
}

/// Forwarded-for (first hop), then X-Real-IP, then CF-Connecting-IP, then the socket peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    ["x-real-ip", "cf-connecting-ip"]
        .iter()
        .filter_map(|name| header_str(headers, name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_precedence() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None), None);
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("10.0.0.9"));

        headers.insert("cf-connecting-ip", HeaderValue::from_static("3.3.3.3"));
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("3.3.3.3"));

        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("2.2.2.2"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.1.1.1, 172.16.0.1, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn test_request_headers_drop_credentials_at_source() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("x-api-key", HeaderValue::from_static("k"));
        headers.insert("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let captured = capture_request_headers(&headers);
        assert!(!captured.contains_key("authorization"));
        assert!(!captured.contains_key("cookie"));
        assert_eq!(captured["x-api-key"], crate::sanitize::REDACTED);
        assert_eq!(captured["accept"], "text/plain, application/json");
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query(Some("skip=0&limit=5&q=a%20b"));
        assert_eq!(params["skip"], "0");
        assert_eq!(params["limit"], "5");
        assert_eq!(params["q"], "a b");
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_request_state_tags() {
        let state = RequestState::new("r".into(), "c".into(), Instant::now());
        let handle = state.clone();
        handle.tag(|t| t.account_id = Some("acct-1".to_string()));
        assert_eq!(state.tags().account_id.as_deref(), Some("acct-1"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "handler panicked");
    }
}
