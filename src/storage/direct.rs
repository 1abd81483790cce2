//! Direct-write path into the embedded store.
//!
//! Plain rusqlite, one synchronous insert per call, no pool and no backend
//! registry in between. Async callers go through [`DirectWriter`], which runs
//! the insert on the blocking pool.

use crate::error::StorageError;
use crate::storage::models::InboundRequestLog;
use crate::storage::schema::{format_timestamp, INSERT_INBOUND_SQL, SCHEMA_STATEMENTS};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    ensure_schema(&conn)?;
    Ok(conn)
}

/// Apply the embedded schema. Safe to call on an already initialized file.
pub fn ensure_schema(conn: &Connection) -> Result<(), StorageError> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute_batch(statement)?;
    }
    Ok(())
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    Ok(serde_json::to_string(value)?)
}

fn insert_request(conn: &Connection, log: &InboundRequestLog) -> Result<(), StorageError> {
    let request_body = log.request_body.as_ref().map(json_text).transpose()?;
    let response_body = log.response_body.as_ref().map(json_text).transpose()?;

    conn.execute(
        INSERT_INBOUND_SQL,
        rusqlite::params![
            log.request_id,
            log.correlation_id,
            log.method,
            log.path,
            log.url,
            json_text(&log.query_params)?,
            json_text(&log.request_headers)?,
            request_body,
            log.request_body_size as i64,
            log.status_code as i64,
            json_text(&log.response_headers)?,
            response_body,
            log.response_body_size as i64,
            log.execution_time_ms,
            log.client_ip,
            log.user_agent,
            log.tags.account_id,
            log.tags.partner_journey_id,
            log.tags.application_id,
            log.tags.user_id,
            log.error_message,
            log.error_type,
            format_timestamp(&log.timestamp),
        ],
    )?;
    Ok(())
}

/// Open the store at `path`, make sure the schema exists and insert one row.
///
/// Blocking. Returns `false` on any failure after logging a warning.
pub fn log_request_direct(path: &Path, log: &InboundRequestLog) -> bool {
    match open_connection(path).and_then(|conn| insert_request(&conn, log)) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                request_id = %log.request_id,
                error = %e,
                "Direct write of request log failed"
            );
            false
        }
    }
}

/// Direct writer that keeps one raw connection open between writes
#[derive(Clone)]
pub struct DirectWriter {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl DirectWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, log: &InboundRequestLog) -> bool {
        let path = self.path.clone();
        let conn = self.conn.clone();
        let log = log.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if guard.is_none() {
                *guard = Some(open_connection(&path)?);
            }
            let Some(active) = guard.as_ref() else {
                return Err(StorageError::NotConfigured("direct writer connection".to_string()));
            };

            let outcome = insert_request(active, &log);
            if outcome.is_err() {
                // reopen on the next write
                *guard = None;
            }
            outcome
        })
        .await
        .map_err(StorageError::from)
        .and_then(|inner| inner);

        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Direct write of request log failed"
                );
                false
            }
        };
        crate::storage::record_write("direct", "inbound", ok);
        ok
    }

    /// Drop the cached connection
    pub fn close(&self) {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}
