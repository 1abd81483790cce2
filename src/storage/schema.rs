//! Embedded store schema, shared by the pooled backend and the direct writer.
//!
//! Every statement is `IF NOT EXISTS`, so applying the schema any number of
//! times is a no-op after the first.

use chrono::{DateTime, SecondsFormat, Utc};

pub const INBOUND_TABLE: &str = "app_requests";
pub const OUTBOUND_TABLE: &str = "api_calls";

pub const SCHEMA_STATEMENTS: [&str; 11] = [
    r#"
    CREATE TABLE IF NOT EXISTS app_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL,
        correlation_id TEXT,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        url TEXT,
        query_params TEXT,
        request_headers TEXT,
        request_body TEXT,
        request_body_size INTEGER NOT NULL DEFAULT 0,
        status_code INTEGER,
        response_headers TEXT,
        response_body TEXT,
        response_body_size INTEGER NOT NULL DEFAULT 0,
        execution_time_ms REAL,
        client_ip TEXT,
        user_agent TEXT,
        account_id TEXT,
        partner_journey_id TEXT,
        application_id TEXT,
        user_id TEXT,
        error_message TEXT,
        error_type TEXT,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_app_request_id ON app_requests(request_id)",
    "CREATE INDEX IF NOT EXISTS idx_app_correlation_id ON app_requests(correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_app_timestamp ON app_requests(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_app_path ON app_requests(path)",
    r#"
    CREATE TABLE IF NOT EXISTS api_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_id TEXT NOT NULL,
        correlation_id TEXT,
        parent_request_id TEXT,
        vendor TEXT NOT NULL,
        method TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        url TEXT,
        request_body TEXT,
        request_params TEXT,
        request_headers TEXT,
        status_code INTEGER,
        response_body TEXT,
        response_headers TEXT,
        status TEXT NOT NULL,
        execution_time_ms REAL,
        account_id TEXT,
        partner_journey_id TEXT,
        application_id TEXT,
        error_message TEXT,
        error_type TEXT,
        circuit_breaker_open INTEGER NOT NULL DEFAULT 0,
        fallback_used INTEGER NOT NULL DEFAULT 0,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_calls_call_id ON api_calls(call_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_correlation_id ON api_calls(correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_timestamp ON api_calls(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_calls_vendor ON api_calls(vendor)",
    "CREATE INDEX IF NOT EXISTS idx_calls_endpoint ON api_calls(endpoint)",
];

pub const INSERT_INBOUND_SQL: &str = r#"
    INSERT INTO app_requests (
        request_id, correlation_id, method, path, url, query_params,
        request_headers, request_body, request_body_size,
        status_code, response_headers, response_body, response_body_size,
        execution_time_ms, client_ip, user_agent,
        account_id, partner_journey_id, application_id, user_id,
        error_message, error_type, timestamp
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
        ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23
    )
"#;

pub const INSERT_OUTBOUND_SQL: &str = r#"
    INSERT INTO api_calls (
        call_id, correlation_id, parent_request_id, vendor, method, endpoint, url,
        request_body, request_params, request_headers,
        status_code, response_body, response_headers, status, execution_time_ms,
        account_id, partner_journey_id, application_id,
        error_message, error_type, circuit_breaker_open, fallback_used, timestamp
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
        ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23
    )
"#;

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
