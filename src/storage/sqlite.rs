//! Embedded file-backed backend (SQLite through a sqlx pool)
//!
//! This is the universal fallback: it needs nothing but a file path. WAL mode
//! plus a generous busy timeout let it share the file with the direct writer.

use crate::error::StorageError;
use crate::storage::models::{
    body_to_text, map_to_text, text_to_body, text_to_map, InboundRequestLog, LogTags,
    OutboundCallLog,
};
use crate::storage::schema::{
    format_timestamp, parse_timestamp, INSERT_INBOUND_SQL, INSERT_OUTBOUND_SQL, SCHEMA_STATEMENTS,
};
use crate::storage::{record_write, LogBackend};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

/// Column list for listings without bodies or headers
const SUMMARY_COLUMNS: &str = "id, request_id, correlation_id, method, path, url, query_params, \
     request_body_size, status_code, response_body_size, execution_time_ms, client_ip, user_agent, \
     account_id, partner_journey_id, application_id, user_id, error_message, error_type, timestamp";

#[derive(Debug, Clone, Serialize)]
pub struct StoredRequest {
    pub id: i64,
    #[serde(flatten)]
    pub log: InboundRequestLog,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredCall {
    pub id: i64,
    pub status: String,
    #[serde(flatten)]
    pub log: OutboundCallLog,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub path: String,
    pub inbound_rows: i64,
    pub outbound_rows: i64,
    pub size_bytes: Option<u64>,
}

pub struct SqliteBackend {
    path: String,
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the store at `path` and apply the schema.
    ///
    /// `":memory:"` opens a private in-memory database on a single connection.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        let base = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new().filename(path)
        };

        let options = base
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let backend = Self {
            path: path.to_string(),
            pool,
        };
        backend.init_schema().await?;

        tracing::info!(path = %backend.path, "Embedded log store ready");
        Ok(backend)
    }

    /// Create tables and indexes if they are missing. Safe to repeat.
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_inbound(&self, log: &InboundRequestLog) -> Result<(), StorageError> {
        sqlx::query(INSERT_INBOUND_SQL)
            .bind(&log.request_id)
            .bind(&log.correlation_id)
            .bind(&log.method)
            .bind(&log.path)
            .bind(&log.url)
            .bind(map_to_text(&log.query_params))
            .bind(map_to_text(&log.request_headers))
            .bind(body_to_text(&log.request_body))
            .bind(log.request_body_size as i64)
            .bind(log.status_code as i64)
            .bind(map_to_text(&log.response_headers))
            .bind(body_to_text(&log.response_body))
            .bind(log.response_body_size as i64)
            .bind(log.execution_time_ms)
            .bind(&log.client_ip)
            .bind(&log.user_agent)
            .bind(&log.tags.account_id)
            .bind(&log.tags.partner_journey_id)
            .bind(&log.tags.application_id)
            .bind(&log.tags.user_id)
            .bind(&log.error_message)
            .bind(&log.error_type)
            .bind(format_timestamp(&log.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_outbound(&self, log: &OutboundCallLog) -> Result<(), StorageError> {
        sqlx::query(INSERT_OUTBOUND_SQL)
            .bind(&log.call_id)
            .bind(&log.correlation_id)
            .bind(&log.parent_request_id)
            .bind(&log.vendor)
            .bind(&log.method)
            .bind(&log.endpoint)
            .bind(&log.url)
            .bind(body_to_text(&log.request_body))
            .bind(map_to_text(&log.request_params))
            .bind(map_to_text(&log.request_headers))
            .bind(log.status_code.map(i64::from))
            .bind(body_to_text(&log.response_body))
            .bind(map_to_text(&log.response_headers))
            .bind(log.status())
            .bind(log.execution_time_ms)
            .bind(&log.tags.account_id)
            .bind(&log.tags.partner_journey_id)
            .bind(&log.tags.application_id)
            .bind(&log.error_message)
            .bind(&log.error_type)
            .bind(log.circuit_breaker_open)
            .bind(log.fallback_used)
            .bind(format_timestamp(&log.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent inbound rows first. Bodies and headers are only loaded
    /// when `include_bodies` is set.
    pub async fn recent_requests(
        &self,
        limit: i64,
        include_bodies: bool,
    ) -> Result<Vec<StoredRequest>, StorageError> {
        let sql = if include_bodies {
            "SELECT * FROM app_requests ORDER BY id DESC LIMIT ?".to_string()
        } else {
            format!(
                "SELECT {} FROM app_requests ORDER BY id DESC LIMIT ?",
                SUMMARY_COLUMNS
            )
        };

        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| request_from_row(row, include_bodies))
            .collect())
    }

    /// Full detail, bodies included, for the latest row with this request id
    pub async fn request_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<StoredRequest>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM app_requests WHERE request_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| request_from_row(&row, true)))
    }

    pub async fn recent_calls(
        &self,
        limit: i64,
        vendor: Option<&str>,
    ) -> Result<Vec<StoredCall>, StorageError> {
        let rows = match vendor {
            Some(vendor) => {
                sqlx::query("SELECT * FROM api_calls WHERE vendor = ? ORDER BY id DESC LIMIT ?")
                    .bind(vendor)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM api_calls ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.iter().map(call_from_row).collect())
    }

    /// Outbound rows sharing a correlation id, oldest first
    pub async fn calls_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<StoredCall>, StorageError> {
        let rows = sqlx::query("SELECT * FROM api_calls WHERE correlation_id = ? ORDER BY id ASC")
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(call_from_row).collect())
    }

    pub async fn stats(&self) -> Result<DbStats, StorageError> {
        let inbound_rows: i64 = sqlx::query("SELECT COUNT(*) AS n FROM app_requests")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let outbound_rows: i64 = sqlx::query("SELECT COUNT(*) AS n FROM api_calls")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let size_bytes = tokio::fs::metadata(&self.path).await.ok().map(|m| m.len());

        Ok(DbStats {
            path: self.path.clone(),
            inbound_rows,
            outbound_rows,
            size_bytes,
        })
    }
}

#[async_trait]
impl LogBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn write_inbound(&self, log: &InboundRequestLog) -> bool {
        let ok = match self.insert_inbound(log).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    backend = "sqlite",
                    request_id = %log.request_id,
                    error = %e,
                    "Failed to write inbound request log"
                );
                false
            }
        };
        record_write(self.name(), "inbound", ok);
        ok
    }

    async fn write_outbound(&self, log: &OutboundCallLog) -> bool {
        let ok = match self.insert_outbound(log).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    backend = "sqlite",
                    call_id = %log.call_id,
                    vendor = %log.vendor,
                    error = %e,
                    "Failed to write outbound call log"
                );
                false
            }
        };
        record_write(self.name(), "outbound", ok);
        ok
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn opt_text(row: &SqliteRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column).ok().flatten()
}

fn request_from_row(row: &SqliteRow, include_bodies: bool) -> StoredRequest {
    let (request_headers, request_body, response_headers, response_body) = if include_bodies {
        (
            text_to_map(opt_text(row, "request_headers")),
            text_to_body(opt_text(row, "request_body")),
            text_to_map(opt_text(row, "response_headers")),
            text_to_body(opt_text(row, "response_body")),
        )
    } else {
        Default::default()
    };

    let timestamp = opt_text(row, "timestamp")
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    StoredRequest {
        id: row.get("id"),
        log: InboundRequestLog {
            request_id: opt_text(row, "request_id").unwrap_or_default(),
            correlation_id: opt_text(row, "correlation_id").unwrap_or_default(),
            method: opt_text(row, "method").unwrap_or_default(),
            path: opt_text(row, "path").unwrap_or_default(),
            url: opt_text(row, "url").unwrap_or_default(),
            query_params: text_to_map(opt_text(row, "query_params")),
            request_headers,
            request_body,
            request_body_size: row.try_get::<i64, _>("request_body_size").unwrap_or(0) as usize,
            status_code: row.try_get::<i64, _>("status_code").unwrap_or(0) as u16,
            response_headers,
            response_body,
            response_body_size: row.try_get::<i64, _>("response_body_size").unwrap_or(0) as usize,
            execution_time_ms: row.try_get::<f64, _>("execution_time_ms").unwrap_or(0.0),
            client_ip: opt_text(row, "client_ip"),
            user_agent: opt_text(row, "user_agent"),
            tags: LogTags {
                account_id: opt_text(row, "account_id"),
                partner_journey_id: opt_text(row, "partner_journey_id"),
                application_id: opt_text(row, "application_id"),
                user_id: opt_text(row, "user_id"),
            },
            error_message: opt_text(row, "error_message"),
            error_type: opt_text(row, "error_type"),
            timestamp,
        },
    }
}

fn call_from_row(row: &SqliteRow) -> StoredCall {
    let timestamp = opt_text(row, "timestamp")
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    StoredCall {
        id: row.get("id"),
        status: opt_text(row, "status").unwrap_or_default(),
        log: OutboundCallLog {
            call_id: opt_text(row, "call_id").unwrap_or_default(),
            correlation_id: opt_text(row, "correlation_id").unwrap_or_default(),
            parent_request_id: opt_text(row, "parent_request_id"),
            vendor: opt_text(row, "vendor").unwrap_or_default(),
            method: opt_text(row, "method").unwrap_or_default(),
            endpoint: opt_text(row, "endpoint").unwrap_or_default(),
            url: opt_text(row, "url").unwrap_or_default(),
            request_body: text_to_body(opt_text(row, "request_body")),
            request_params: text_to_map(opt_text(row, "request_params")),
            request_headers: text_to_map(opt_text(row, "request_headers")),
            status_code: row
                .try_get::<Option<i64>, _>("status_code")
                .ok()
                .flatten()
                .map(|code| code as u16),
            response_body: text_to_body(opt_text(row, "response_body")),
            response_headers: text_to_map(opt_text(row, "response_headers")),
            execution_time_ms: row.try_get::<f64, _>("execution_time_ms").unwrap_or(0.0),
            tags: LogTags {
                account_id: opt_text(row, "account_id"),
                partner_journey_id: opt_text(row, "partner_journey_id"),
                application_id: opt_text(row, "application_id"),
                user_id: None,
            },
            error_message: opt_text(row, "error_message"),
            error_type: opt_text(row, "error_type"),
            circuit_breaker_open: row.try_get::<bool, _>("circuit_breaker_open").unwrap_or(false),
            fallback_used: row.try_get::<bool, _>("fallback_used").unwrap_or(false),
            timestamp,
        },
    }
}
