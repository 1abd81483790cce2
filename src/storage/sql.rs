//! Generic SQL backend over `sqlx::any`, selected by URL scheme
//! (`sqlite:`, `postgres:`, `mysql:`).

use crate::error::StorageError;
use crate::storage::models::{body_to_text, map_to_text, InboundRequestLog, OutboundCallLog};
use crate::storage::schema::format_timestamp;
use crate::storage::{record_write, LogBackend};
use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::time::Duration;

pub const REQUEST_LOG_TABLE: &str = "api_request_logs";
pub const CALL_LOG_TABLE: &str = "internal_api_logs";

const INBOUND_COLUMNS: [&str; 23] = [
    "request_id",
    "correlation_id",
    "method",
    "path",
    "url",
    "query_params",
    "request_headers",
    "request_body",
    "request_body_size",
    "status_code",
    "response_headers",
    "response_body",
    "response_body_size",
    "execution_time_ms",
    "client_ip",
    "user_agent",
    "account_id",
    "partner_journey_id",
    "application_id",
    "user_id",
    "error_message",
    "error_type",
    "timestamp",
];

const OUTBOUND_COLUMNS: [&str; 23] = [
    "call_id",
    "correlation_id",
    "parent_request_id",
    "vendor",
    "method",
    "endpoint",
    "url",
    "request_body",
    "request_params",
    "request_headers",
    "status_code",
    "response_body",
    "response_headers",
    "status",
    "execution_time_ms",
    "account_id",
    "partner_journey_id",
    "application_id",
    "error_message",
    "error_type",
    "circuit_breaker_open",
    "fallback_used",
    "timestamp",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            _ => None,
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Self::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Self::Postgres => "id BIGSERIAL PRIMARY KEY",
            Self::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
        }
    }

    fn placeholders(self, count: usize) -> String {
        (1..=count)
            .map(|i| match self {
                Self::Postgres => format!("${}", i),
                _ => "?".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// CREATE TABLE plus its indexes. MySQL has no `CREATE INDEX IF NOT EXISTS`,
    /// so its indexes are declared inline.
    fn create_statements(self, table: &str, columns: &str, indexes: &[(&str, &str)]) -> Vec<String> {
        match self {
            Self::MySql => {
                let inline: String = indexes
                    .iter()
                    .map(|(name, column)| format!(",\n    INDEX {} ({})", name, column))
                    .collect();
                vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} (\n    {},\n{}{}\n)",
                    table,
                    self.id_column(),
                    columns,
                    inline
                )]
            }
            _ => {
                let mut statements = vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} (\n    {},\n{}\n)",
                    table,
                    self.id_column(),
                    columns
                )];
                statements.extend(indexes.iter().map(|(name, column)| {
                    format!("CREATE INDEX IF NOT EXISTS {} ON {} ({})", name, table, column)
                }));
                statements
            }
        }
    }

    pub fn schema(self) -> Vec<String> {
        let inbound = r#"    request_id VARCHAR(64) NOT NULL,
    correlation_id VARCHAR(64),
    method VARCHAR(16) NOT NULL,
    path VARCHAR(255) NOT NULL,
    url TEXT,
    query_params TEXT,
    request_headers TEXT,
    request_body TEXT,
    request_body_size BIGINT NOT NULL,
    status_code BIGINT,
    response_headers TEXT,
    response_body TEXT,
    response_body_size BIGINT NOT NULL,
    execution_time_ms DOUBLE PRECISION,
    client_ip VARCHAR(64),
    user_agent TEXT,
    account_id VARCHAR(128),
    partner_journey_id VARCHAR(128),
    application_id VARCHAR(128),
    user_id VARCHAR(128),
    error_message TEXT,
    error_type VARCHAR(128),
    timestamp VARCHAR(40) NOT NULL"#;

        let outbound = r#"    call_id VARCHAR(64) NOT NULL,
    correlation_id VARCHAR(64),
    parent_request_id VARCHAR(64),
    vendor VARCHAR(128) NOT NULL,
    method VARCHAR(16) NOT NULL,
    endpoint VARCHAR(255) NOT NULL,
    url TEXT,
    request_body TEXT,
    request_params TEXT,
    request_headers TEXT,
    status_code BIGINT,
    response_body TEXT,
    response_headers TEXT,
    status VARCHAR(16) NOT NULL,
    execution_time_ms DOUBLE PRECISION,
    account_id VARCHAR(128),
    partner_journey_id VARCHAR(128),
    application_id VARCHAR(128),
    error_message TEXT,
    error_type VARCHAR(128),
    circuit_breaker_open BIGINT NOT NULL,
    fallback_used BIGINT NOT NULL,
    timestamp VARCHAR(40) NOT NULL"#;

        let mut statements = self.create_statements(
            REQUEST_LOG_TABLE,
            inbound,
            &[
                ("idx_req_log_request_id", "request_id"),
                ("idx_req_log_correlation_id", "correlation_id"),
                ("idx_req_log_path", "path"),
                ("idx_req_log_status_code", "status_code"),
                ("idx_req_log_account_id", "account_id"),
                ("idx_req_log_timestamp", "timestamp"),
            ],
        );
        statements.extend(self.create_statements(
            CALL_LOG_TABLE,
            outbound,
            &[
                ("idx_call_log_call_id", "call_id"),
                ("idx_call_log_correlation_id", "correlation_id"),
                ("idx_call_log_parent_request_id", "parent_request_id"),
                ("idx_call_log_vendor", "vendor"),
                ("idx_call_log_endpoint", "endpoint"),
                ("idx_call_log_timestamp", "timestamp"),
            ],
        ));
        statements
    }

    fn insert(self, table: &str, columns: &[&str]) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            self.placeholders(columns.len())
        )
    }
}

pub struct SqlBackend {
    dialect: Dialect,
    pool: AnyPool,
    insert_inbound_sql: String,
    insert_outbound_sql: String,
}

impl SqlBackend {
    /// Connect a pool and create the tables if they are missing
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let dialect = Dialect::from_url(url)
            .ok_or_else(|| StorageError::NotConfigured(format!("unsupported SQL url scheme in {}", url)))?;

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(3600))
            .test_before_acquire(true)
            .connect(url)
            .await?;

        let backend = Self {
            dialect,
            pool,
            insert_inbound_sql: dialect.insert(REQUEST_LOG_TABLE, &INBOUND_COLUMNS),
            insert_outbound_sql: dialect.insert(CALL_LOG_TABLE, &OUTBOUND_COLUMNS),
        };
        backend.create_tables().await?;

        tracing::info!(dialect = ?dialect, "SQL log backend ready");
        Ok(backend)
    }

    pub async fn create_tables(&self) -> Result<(), StorageError> {
        for statement in self.dialect.schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn insert_inbound(&self, log: &InboundRequestLog) -> Result<(), StorageError> {
        sqlx::query(&self.insert_inbound_sql)
            .bind(log.request_id.clone())
            .bind(log.correlation_id.clone())
            .bind(log.method.clone())
            .bind(log.path.clone())
            .bind(log.url.clone())
            .bind(map_to_text(&log.query_params))
            .bind(map_to_text(&log.request_headers))
            .bind(body_to_text(&log.request_body))
            .bind(log.request_body_size as i64)
            .bind(log.status_code as i64)
            .bind(map_to_text(&log.response_headers))
            .bind(body_to_text(&log.response_body))
            .bind(log.response_body_size as i64)
            .bind(log.execution_time_ms)
            .bind(log.client_ip.clone())
            .bind(log.user_agent.clone())
            .bind(log.tags.account_id.clone())
            .bind(log.tags.partner_journey_id.clone())
            .bind(log.tags.application_id.clone())
            .bind(log.tags.user_id.clone())
            .bind(log.error_message.clone())
            .bind(log.error_type.clone())
            .bind(format_timestamp(&log.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_outbound(&self, log: &OutboundCallLog) -> Result<(), StorageError> {
        sqlx::query(&self.insert_outbound_sql)
            .bind(log.call_id.clone())
            .bind(log.correlation_id.clone())
            .bind(log.parent_request_id.clone())
            .bind(log.vendor.clone())
            .bind(log.method.clone())
            .bind(log.endpoint.clone())
            .bind(log.url.clone())
            .bind(body_to_text(&log.request_body))
            .bind(map_to_text(&log.request_params))
            .bind(map_to_text(&log.request_headers))
            .bind(log.status_code.map(i64::from))
            .bind(body_to_text(&log.response_body))
            .bind(map_to_text(&log.response_headers))
            .bind(log.status().to_string())
            .bind(log.execution_time_ms)
            .bind(log.tags.account_id.clone())
            .bind(log.tags.partner_journey_id.clone())
            .bind(log.tags.application_id.clone())
            .bind(log.error_message.clone())
            .bind(log.error_type.clone())
            .bind(i64::from(log.circuit_breaker_open))
            .bind(i64::from(log.fallback_used))
            .bind(format_timestamp(&log.timestamp))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogBackend for SqlBackend {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn write_inbound(&self, log: &InboundRequestLog) -> bool {
        let ok = match self.insert_inbound(log).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = "sql", request_id = %log.request_id, error = %e, "Failed to write inbound request log");
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
                tracing::warn!(backend = "sql", call_id = %log.call_id, error = %e, "Failed to write outbound call log");
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
