//! Backend registry: decides which backends are active and fans writes out to them

use crate::config::StorageConfig;
use crate::storage::{
    DocumentBackend, DynamoBackend, InboundRequestLog, LogBackend, OutboundCallLog, SqlBackend,
    SqliteBackend,
};
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Count of detached writes still running
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements on drop, so an aborted or panicking write still settles the count
struct PendingGuard(Arc<PendingWrites>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct LogRegistry {
    backends: Vec<Arc<dyn LogBackend>>,
    /// Tried only when every active backend failed a write
    standby: Option<Arc<dyn LogBackend>>,
    embedded: Option<Arc<SqliteBackend>>,
    pending: Arc<PendingWrites>,
}

impl LogRegistry {
    /// Build the active backend list in precedence order: document store,
    /// DynamoDB, generic SQL, then the embedded store when explicitly enabled
    /// or when nothing else came up and fallback is allowed.
    pub async fn from_config(config: &StorageConfig) -> Self {
        let mut backends: Vec<Arc<dyn LogBackend>> = Vec::new();

        if config.document.enabled {
            let backend = DocumentBackend::new(config.document.clone());
            if backend.is_available() {
                backends.push(Arc::new(backend));
            } else {
                tracing::warn!("Document store enabled but no endpoint configured, skipping");
            }
        }

        if config.dynamodb.enabled {
            let backend = DynamoBackend::new(config.dynamodb.clone());
            if backend.is_available() {
                backends.push(Arc::new(backend));
            } else {
                tracing::warn!("DynamoDB enabled but no table configured, skipping");
            }
        }

        if let Some(url) = &config.sql_url {
            match SqlBackend::connect(url, config.sql_max_connections).await {
                Ok(backend) => backends.push(Arc::new(backend)),
                Err(e) => tracing::warn!(error = %e, "SQL log backend unavailable"),
            }
        }

        let wants_embedded = config.sqlite_enabled || (backends.is_empty() && config.fallback_enabled);
        let embedded = if wants_embedded || config.fallback_enabled {
            match SqliteBackend::open(&config.sqlite_path).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    tracing::warn!(path = %config.sqlite_path, error = %e, "Embedded log store unavailable");
                    None
                }
            }
        } else {
            None
        };

        let mut standby: Option<Arc<dyn LogBackend>> = None;
        if let Some(store) = &embedded {
            if wants_embedded {
                backends.push(store.clone());
            } else {
                standby = Some(store.clone());
            }
        }

        let registry = Self {
            backends,
            standby,
            embedded,
            pending: Arc::default(),
        };
        tracing::info!(
            backends = ?registry.active_backends(),
            standby = registry.standby.is_some(),
            "Log registry initialized"
        );
        registry
    }

    /// Registry over an explicit backend list
    pub fn with_backends(
        backends: Vec<Arc<dyn LogBackend>>,
        standby: Option<Arc<dyn LogBackend>>,
    ) -> Self {
        Self {
            backends,
            standby,
            embedded: None,
            pending: Arc::default(),
        }
    }

    /// Attach an embedded store for read access
    pub fn with_embedded(mut self, store: Arc<SqliteBackend>) -> Self {
        self.embedded = Some(store);
        self
    }

    pub fn active_backends(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// The embedded store, active or standby, for admin reads
    pub fn embedded(&self) -> Option<Arc<SqliteBackend>> {
        self.embedded.clone()
    }

    /// Write an outbound row to every active backend. Returns whether any
    /// backend (or the standby) accepted it.
    pub async fn log_call(&self, log: &OutboundCallLog) -> bool {
        let results = join_all(
            self.backends
                .iter()
                .filter(|b| b.is_available())
                .map(|b| b.write_outbound(log)),
        )
        .await;

        if results.iter().any(|ok| *ok) {
            return true;
        }

        match &self.standby {
            Some(standby) => {
                tracing::warn!(call_id = %log.call_id, "All log backends failed, writing call to standby store");
                standby.write_outbound(log).await
            }
            None => false,
        }
    }

    /// Write an inbound row to every active backend. Same semantics as [`Self::log_call`].
    pub async fn log_request(&self, log: &InboundRequestLog) -> bool {
        let results = join_all(
            self.backends
                .iter()
                .filter(|b| b.is_available())
                .map(|b| b.write_inbound(log)),
        )
        .await;

        if results.iter().any(|ok| *ok) {
            return true;
        }

        match &self.standby {
            Some(standby) => {
                tracing::warn!(request_id = %log.request_id, "All log backends failed, writing request to standby store");
                standby.write_inbound(log).await
            }
            None => false,
        }
    }

    /// Run a write on its own task so the caller's future can finish or be
    /// dropped without losing the row. [`Self::flush`] waits for it.
    pub fn detach<F>(&self, write: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, log write dropped");
            return;
        };
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(self.pending.clone());
        handle.spawn(async move {
            let _guard = guard;
            write.await;
        });
    }

    /// Fire-and-forget [`Self::log_call`]
    pub fn spawn_call(self: &Arc<Self>, log: OutboundCallLog) {
        let registry = self.clone();
        self.detach(async move {
            registry.log_call(&log).await;
        });
    }

    /// Wait until every detached write has finished
    pub async fn flush(&self) {
        loop {
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        self.flush().await;
        for backend in &self.backends {
            backend.close().await;
            tracing::debug!(backend = backend.name(), "Log backend closed");
        }
        if let Some(standby) = &self.standby {
            standby.close().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DocumentStoreConfig, DynamoConfig};
    use crate::storage::models::fixtures;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Backend that counts writes and succeeds or fails on demand
    pub(crate) struct CountingBackend {
        pub ok: bool,
        pub writes: AtomicUsize,
    }

    impl CountingBackend {
        pub fn new(ok: bool) -> Arc<Self> {
            Arc::new(Self {
                ok,
                writes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LogBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn write_inbound(&self, _log: &InboundRequestLog) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.ok
        }
        async fn write_outbound(&self, _log: &OutboundCallLog) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.ok
        }
        async fn close(&self) {}
    }

    /// Backend whose writes take `delay` before succeeding
    pub(crate) struct SlowBackend {
        pub delay: std::time::Duration,
        pub writes: AtomicUsize,
    }

    impl SlowBackend {
        pub fn new(delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                writes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LogBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn write_inbound(&self, _log: &InboundRequestLog) -> bool {
            tokio::time::sleep(self.delay).await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn write_outbound(&self, _log: &OutboundCallLog) -> bool {
            tokio::time::sleep(self.delay).await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn close(&self) {}
    }

    fn storage_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            sqlite_path: dir.path().join("registry.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_default_config_uses_embedded_only() {
        let dir = TempDir::new().unwrap();
        let registry = LogRegistry::from_config(&storage_config(&dir)).await;
        assert_eq!(registry.active_backends(), vec!["sqlite"]);
        assert!(registry.embedded().is_some());

        assert!(registry.log_request(&fixtures::inbound("r1")).await);
        let rows = registry.embedded().unwrap().recent_requests(10, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_precedence_order() {
        let dir = TempDir::new().unwrap();
        let mut config = storage_config(&dir);
        config.document = DocumentStoreConfig {
            enabled: true,
            endpoint: Some("http://127.0.0.1:9".to_string()),
            ..DocumentStoreConfig::default()
        };
        config.dynamodb = DynamoConfig {
            enabled: true,
            table: Some("logs".to_string()),
            ..DynamoConfig::default()
        };

        let registry = LogRegistry::from_config(&config).await;
        assert_eq!(registry.active_backends(), vec!["document", "dynamodb", "sqlite"]);
    }

    #[tokio::test]
    async fn test_embedded_disabled_becomes_standby() {
        let dir = TempDir::new().unwrap();
        let mut config = storage_config(&dir);
        config.sqlite_enabled = false;
        config.document = DocumentStoreConfig {
            enabled: true,
            endpoint: Some("http://127.0.0.1:9".to_string()),
            ..DocumentStoreConfig::default()
        };

        let registry = LogRegistry::from_config(&config).await;
        assert_eq!(registry.active_backends(), vec!["document"]);
        assert!(registry.standby.is_some());
    }

    #[tokio::test]
    async fn test_nothing_enabled_without_fallback() {
        let dir = TempDir::new().unwrap();
        let mut config = storage_config(&dir);
        config.sqlite_enabled = false;
        config.fallback_enabled = false;

        let registry = LogRegistry::from_config(&config).await;
        assert!(registry.active_backends().is_empty());
        assert!(!registry.log_call(&fixtures::outbound("c1", "weather")).await);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let failing = CountingBackend::new(false);
        let healthy = CountingBackend::new(true);
        let backends: Vec<Arc<dyn LogBackend>> = vec![failing.clone(), healthy.clone()];
        let registry = LogRegistry::with_backends(backends, None);

        assert!(registry.log_call(&fixtures::outbound("c1", "weather")).await);
        assert_eq!(failing.writes.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_backends_failing_degrade_to_embedded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut config = storage_config(&dir);
        config.sqlite_enabled = false;
        config.fallback_enabled = true;
        config.document = DocumentStoreConfig {
            enabled: true,
            endpoint: Some(server.uri()),
            ..DocumentStoreConfig::default()
        };
        config.dynamodb = DynamoConfig {
            enabled: true,
            table: Some("logs".to_string()),
            endpoint: Some(format!("{}/", server.uri())),
            access_key_id: Some("AK".to_string()),
            secret_access_key: Some("SK".to_string()),
            ..DynamoConfig::default()
        };

        let registry = LogRegistry::from_config(&config).await;
        assert_eq!(registry.active_backends(), vec!["document", "dynamodb"]);

        assert!(registry.log_call(&fixtures::outbound("c1", "weather")).await);
        assert!(registry.log_request(&fixtures::inbound("r1")).await);

        let store = registry.embedded().unwrap();
        assert_eq!(store.recent_calls(10, None).await.unwrap().len(), 1);
        assert_eq!(store.recent_requests(10, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_call_is_written_after_caller_returns() {
        let slow = SlowBackend::new(std::time::Duration::from_millis(100));
        let backends: Vec<Arc<dyn LogBackend>> = vec![slow.clone()];
        let registry = Arc::new(LogRegistry::with_backends(backends, None));

        let started = std::time::Instant::now();
        registry.spawn_call(fixtures::outbound("c1", "weather"));
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
        assert_eq!(registry.pending_writes(), 1);
        assert_eq!(slow.writes.load(Ordering::SeqCst), 0);

        registry.flush().await;
        assert_eq!(registry.pending_writes(), 0);
        assert_eq!(slow.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_waits_for_detached_writes() {
        let slow = SlowBackend::new(std::time::Duration::from_millis(50));
        let backends: Vec<Arc<dyn LogBackend>> = vec![slow.clone()];
        let registry = Arc::new(LogRegistry::with_backends(backends, None));

        registry.spawn_call(fixtures::outbound("c1", "weather"));
        registry.spawn_call(fixtures::outbound("c2", "weather"));
        registry.close().await;
        assert_eq!(slow.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending_returns() {
        let registry = LogRegistry::with_backends(Vec::new(), None);
        registry.flush().await;
        assert_eq!(registry.pending_writes(), 0);
    }
}
