//! Pluggable persistence for inbound request rows and outbound call rows

pub mod direct;
pub mod document;
pub mod dynamo;
pub mod models;
pub mod schema;
mod sigv4;
pub mod sql;
pub mod sqlite;

pub use direct::{log_request_direct, DirectWriter};
pub use document::DocumentBackend;
pub use dynamo::DynamoBackend;
pub use models::{InboundRequestLog, LogTags, OutboundCallLog};
pub use sql::SqlBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;

/// A single persistence engine.
///
/// Writes never fail loudly: any I/O problem is logged as a warning and
/// reported as `false` so the caller can move on to the next backend.
#[async_trait]
pub trait LogBackend: Send + Sync + 'static {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Configuration is present. Performs no I/O.
    fn is_available(&self) -> bool;

    async fn write_inbound(&self, log: &InboundRequestLog) -> bool;

    async fn write_outbound(&self, log: &OutboundCallLog) -> bool;

    async fn close(&self);
}

pub(crate) fn record_write(backend: &'static str, kind: &'static str, ok: bool) {
    crate::metrics::record_backend_write(backend, kind, ok);
}
