//! Outbound call client: correlation headers, circuit breaking, per-attempt logging

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakers};
use crate::config::{Config, VendorConfig};
use crate::correlation::{self, REQUEST_ID_HEADER};
use crate::error::CallError;
use crate::registry::LogRegistry;
use crate::sanitize::{sanitize_headers, sanitize_params, sanitize_value};
use crate::storage::models::{decode_response_body, elapsed_ms, truncate_message};
use crate::storage::{LogTags, OutboundCallLog};
use async_trait::async_trait;
use axum::body::Bytes;
use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::Connect(_) => "ConnectError",
            Self::Other(_) => "TransportError",
        }
    }
}

/// Lower-level HTTP transport underneath [`CallLoggingClient`]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        request: TransportRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(timeout);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Per-call inputs beyond method and endpoint
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub body: Option<Value>,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub tags: LogTags,
}

impl CallOptions {
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn tags(mut self, tags: LogTags) -> Self {
        self.tags = tags;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

enum AttemptFailure {
    CircuitOpen,
    Failed(CallError),
}

/// Records a breaker failure and a `Cancelled` row if the attempt future is
/// dropped mid-transport.
struct InFlightGuard {
    breaker: Arc<CircuitBreaker>,
    registry: Arc<LogRegistry>,
    row: OutboundCallLog,
    started: Instant,
    armed: bool,
}

impl InFlightGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.breaker.record_failure();
        let mut row = self.row.clone();
        row.execution_time_ms = elapsed_ms(self.started.elapsed());
        row.error_type = Some("Cancelled".to_string());
        row.error_message = Some("call was cancelled before a response arrived".to_string());
        tracing::warn!(vendor = %row.vendor, call_id = %row.call_id, "Outbound call cancelled");
        self.registry.spawn_call(row);
    }
}

pub struct CallLoggingClient {
    vendor: String,
    config: VendorConfig,
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<LogRegistry>,
    correlation_header: String,
    propagate_correlation: bool,
    fallback: Option<Arc<CallLoggingClient>>,
}

impl CallLoggingClient {
    pub fn new(
        vendor: impl Into<String>,
        config: VendorConfig,
        transport: Arc<dyn Transport>,
        breakers: &CircuitBreakers,
        registry: Arc<LogRegistry>,
        correlation_header: impl Into<String>,
    ) -> Self {
        let vendor = vendor.into();
        let breaker = breakers.get_or_create(&vendor, config.failure_threshold, config.recovery_timeout());
        Self {
            vendor,
            config,
            transport,
            breaker,
            registry,
            correlation_header: correlation_header.into(),
            propagate_correlation: true,
            fallback: None,
        }
    }

    /// Whether the correlation and `X-Request-ID` headers are sent
    pub fn with_correlation(mut self, propagate: bool) -> Self {
        self.propagate_correlation = propagate;
        self
    }

    /// Client tried once, transparently, when this vendor's circuit is open
    pub fn with_fallback(mut self, fallback: Arc<CallLoggingClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn get(&self, endpoint: &str, options: CallOptions) -> Result<CallResponse, CallError> {
        self.request(Method::GET, endpoint, options).await
    }

    pub async fn post(&self, endpoint: &str, body: Value, options: CallOptions) -> Result<CallResponse, CallError> {
        self.request(Method::POST, endpoint, options.json(body)).await
    }

    /// Make one call, plus at most one fallback attempt when the circuit is open.
    ///
    /// Any HTTP response, whatever its status, is returned as `Ok`. Transport
    /// errors and timeouts are `ExternalCallFailed`. Every attempt is logged.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        options: CallOptions,
    ) -> Result<CallResponse, CallError> {
        let correlation_id = match correlation::current() {
            Some(id) => id,
            None => {
                let id = correlation::generate();
                if self.propagate_correlation {
                    correlation::bind(id.clone());
                }
                id
            }
        };
        let parent_request_id = correlation::current_request_id();

        let primary = self
            .attempt(&method, endpoint, &options, &correlation_id, &parent_request_id, false)
            .await;

        match primary {
            Ok(response) => Ok(response),
            Err(AttemptFailure::Failed(e)) => Err(e),
            Err(AttemptFailure::CircuitOpen) => match &self.fallback {
                Some(fallback) => {
                    tracing::info!(
                        vendor = %self.vendor,
                        fallback = %fallback.vendor,
                        "Circuit open, retrying call against fallback"
                    );
                    fallback
                        .attempt(&method, endpoint, &options, &correlation_id, &parent_request_id, true)
                        .await
                        .map_err(|failure| match failure {
                            AttemptFailure::Failed(e) => e,
                            AttemptFailure::CircuitOpen => CallError::ServiceUnavailable {
                                vendor: fallback.vendor.clone(),
                            },
                        })
                }
                None => Err(CallError::ServiceUnavailable {
                    vendor: self.vendor.clone(),
                }),
            },
        }
    }

    fn build_headers(&self, correlation_id: &str, caller: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = self.config.headers.clone();
        if let Some(key) = &self.config.api_key {
            headers.insert(self.config.api_key_header.clone(), key.clone());
        }
        if self.propagate_correlation {
            headers.insert(self.correlation_header.clone(), correlation_id.to_string());
            headers.insert(REQUEST_ID_HEADER.to_string(), correlation_id.to_string());
        }
        for (name, value) in caller {
            // caller wins, whatever the header's casing
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    async fn attempt(
        &self,
        method: &Method,
        endpoint: &str,
        options: &CallOptions,
        correlation_id: &str,
        parent_request_id: &Option<String>,
        fallback_used: bool,
    ) -> Result<CallResponse, AttemptFailure> {
        let url = join_url(&self.config.base_url, endpoint);
        let headers = self.build_headers(correlation_id, &options.headers);
        let mut params = self.config.params.clone();
        params.extend(options.params.clone());

        let mut row = OutboundCallLog {
            call_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            parent_request_id: parent_request_id.clone(),
            vendor: self.vendor.clone(),
            method: method.as_str().to_string(),
            endpoint: endpoint.to_string(),
            url: url.clone(),
            request_body: options.body.as_ref().map(sanitize_value),
            request_params: sanitize_params(&params),
            request_headers: sanitize_headers(&headers),
            status_code: None,
            response_body: None,
            response_headers: BTreeMap::new(),
            execution_time_ms: 0.0,
            tags: options.tags.clone(),
            error_message: None,
            error_type: None,
            circuit_breaker_open: false,
            fallback_used,
            timestamp: Utc::now(),
        };

        tracing::debug!(
            vendor = %self.vendor,
            method = %method,
            url = %url,
            correlation_id = %correlation_id,
            headers = ?row.request_headers,
            body = ?row.request_body,
            "Outbound call starting"
        );

        if let Err(retry_after) = self.breaker.try_acquire() {
            row.circuit_breaker_open = true;
            row.error_type = Some("CircuitOpen".to_string());
            row.error_message = Some(format!(
                "circuit open for {}, retry in {:.1}s",
                self.vendor,
                retry_after.as_secs_f64()
            ));
            tracing::warn!(vendor = %self.vendor, call_id = %row.call_id, "Outbound call rejected, circuit open");
            crate::metrics::record_outbound(&self.vendor, "circuit_open", Duration::ZERO);
            self.registry.spawn_call(row);
            return Err(AttemptFailure::CircuitOpen);
        }

        let request = TransportRequest {
            method: method.clone(),
            url,
            headers,
            params,
            body: options.body.clone(),
        };

        let started = Instant::now();
        let guard = InFlightGuard {
            breaker: self.breaker.clone(),
            registry: self.registry.clone(),
            row: row.clone(),
            started,
            armed: true,
        };
        let timeout = self.config.timeout();
        let result = tokio::time::timeout(timeout, self.transport.send(request, timeout)).await;
        let elapsed = started.elapsed();
        guard.disarm();
        row.execution_time_ms = elapsed_ms(elapsed);

        let outcome = match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout),
        };

        match outcome {
            Ok(response) => {
                self.breaker.record_success();
                let body = decode_response_body(&response.body);

                row.status_code = Some(response.status);
                row.response_body = Some(sanitize_value(&body));
                row.response_headers = sanitize_headers(&response.headers);

                tracing::info!(
                    vendor = %self.vendor,
                    status = response.status,
                    execution_time_ms = row.execution_time_ms,
                    fallback_used,
                    "Outbound call finished"
                );
                crate::metrics::record_outbound(&self.vendor, "success", elapsed);
                self.registry.spawn_call(row);

                Ok(CallResponse {
                    status: response.status,
                    headers: response.headers,
                    body,
                })
            }
            Err(e) => {
                self.breaker.record_failure();
                let message = match &e {
                    TransportError::Timeout => format!("timed out after {:.1}s", timeout.as_secs_f64()),
                    other => other.to_string(),
                };

                row.error_type = Some(e.error_type().to_string());
                row.error_message = Some(truncate_message(&message));

                tracing::warn!(
                    vendor = %self.vendor,
                    error = %message,
                    execution_time_ms = row.execution_time_ms,
                    "Outbound call failed"
                );
                crate::metrics::record_outbound(&self.vendor, "failure", elapsed);
                self.registry.spawn_call(row);

                Err(AttemptFailure::Failed(CallError::ExternalCallFailed {
                    vendor: self.vendor.clone(),
                    message,
                }))
            }
        }
    }
}

/// `base` without trailing slashes + `/` + `endpoint` without leading slashes.
/// Absolute endpoints are used as-is.
pub fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Envelope returned by [`call_api`]
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    pub execution_time_ms: f64,
}

/// One-shot helper that never returns an error: failures land in the envelope
pub async fn call_api(
    client: &CallLoggingClient,
    method: Method,
    endpoint: &str,
    options: CallOptions,
) -> CallSummary {
    let started = Instant::now();
    let result = client.request(method, endpoint, options).await;
    let execution_time_ms = elapsed_ms(started.elapsed());

    match result {
        Ok(response) => CallSummary {
            success: (200..300).contains(&response.status),
            data: Some(response.body),
            error: None,
            status_code: Some(response.status),
            execution_time_ms,
        },
        Err(e) => CallSummary {
            success: false,
            data: None,
            error: Some(e.to_string()),
            status_code: None,
            execution_time_ms,
        },
    }
}

/// Clients for every configured vendor, sharing one breaker set and registry
pub struct OutboundClients {
    clients: BTreeMap<String, Arc<CallLoggingClient>>,
    breakers: Arc<CircuitBreakers>,
}

impl OutboundClients {
    pub fn from_config(
        config: &Config,
        registry: Arc<LogRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakers::new());
        let header = config.logging.correlation_header.clone();
        let propagate = config.logging.enable_correlation;

        let plain: BTreeMap<String, Arc<CallLoggingClient>> = config
            .vendors
            .iter()
            .map(|(name, vendor)| {
                let client = CallLoggingClient::new(
                    name.clone(),
                    vendor.clone(),
                    transport.clone(),
                    &breakers,
                    registry.clone(),
                    header.clone(),
                )
                .with_correlation(propagate);
                (name.clone(), Arc::new(client))
            })
            .collect();

        // Fallback targets are the plain clients, so a fallback never chains further
        let clients = config
            .vendors
            .iter()
            .map(|(name, vendor)| {
                let mut client = CallLoggingClient::new(
                    name.clone(),
                    vendor.clone(),
                    transport.clone(),
                    &breakers,
                    registry.clone(),
                    header.clone(),
                )
                .with_correlation(propagate);
                if let Some(target) = vendor.fallback.as_ref().and_then(|f| plain.get(f)) {
                    client = client.with_fallback(target.clone());
                }
                (name.clone(), Arc::new(client))
            })
            .collect();

        Self { clients, breakers }
    }

    pub fn get(&self, vendor: &str) -> Option<Arc<CallLoggingClient>> {
        self.clients.get(vendor).cloned()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn vendors(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}
