use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    admin::{self, AdminState},
    client::{OutboundClients, ReqwestTransport},
    config::Config,
    metrics,
    middleware::{request_logging_middleware, RequestLoggingState},
    registry::LogRegistry,
    signals::setup_signal_handlers,
    storage::DirectWriter,
};

/// Process-wide objects built once at startup and torn down at shutdown
pub struct Services {
    pub registry: Arc<LogRegistry>,
    pub clients: Arc<OutboundClients>,
    pub logging: Arc<RequestLoggingState>,
}

impl Services {
    pub async fn build(config: &Config) -> Self {
        let registry = Arc::new(LogRegistry::from_config(&config.storage).await);

        let storage = &config.storage;
        let direct = (storage.sqlite_enabled || storage.fallback_enabled)
            .then(|| DirectWriter::new(&storage.sqlite_path));

        let logging = Arc::new(
            RequestLoggingState::new(config.logging.clone(), direct, registry.clone())
                .with_max_body_bytes(config.server.max_body_bytes),
        );

        let clients = Arc::new(OutboundClients::from_config(
            config,
            registry.clone(),
            Arc::new(ReqwestTransport::default()),
        ));

        Self {
            registry,
            clients,
            logging,
        }
    }

    pub async fn close(&self) {
        self.registry.flush().await;
        if let Some(direct) = &self.logging.direct {
            direct.close();
        }
        self.registry.close().await;
    }
}

/// Wrap any router with the inbound request logging layer
pub fn with_request_logging(router: Router, state: Arc<RequestLoggingState>) -> Router {
    router.layer(middleware::from_fn_with_state(state, request_logging_middleware))
}

/// Start the audit server and block until a shutdown signal
pub async fn start_server(config: Config) -> Result<()> {
    let metrics_handle = match metrics::init_metrics() {
        Ok(handle) => Some(Arc::new(handle)),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let services = Services::build(&config).await;
    let app = create_router(&services, &config, metrics_handle);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid server host '{}'", config.server.host))?,
        config.server.port,
    ));

    info!(
        %addr,
        backends = ?services.registry.active_backends(),
        vendors = config.vendors.len(),
        "Starting request audit server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        info!("Draining connections...");
    })
    .await?;

    signal_handle.abort();
    services.close().await;
    info!("Server stopped gracefully");

    Ok(())
}

/// Health, metrics and admin routes behind the logging layer
pub fn create_router(
    services: &Services,
    config: &Config,
    metrics_handle: Option<Arc<PrometheusHandle>>,
) -> Router {
    let admin_state = AdminState {
        registry: services.registry.clone(),
        breakers: services.clients.breakers().clone(),
    };

    let admin_routes = Router::new()
        .route("/admin/logs/requests", get(admin::list_requests))
        .route("/admin/logs/requests/:request_id", get(admin::get_request))
        .route("/admin/logs/calls", get(admin::list_calls))
        .route("/admin/logs/db-info", get(admin::db_info))
        .route("/admin/circuits", get(admin::circuits))
        .with_state(admin_state);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(metrics_handle)
        .merge(admin_routes);

    with_request_logging(app, services.logging.clone())
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_endpoint(
    State(handle): State<Option<Arc<PrometheusHandle>>>,
) -> impl IntoResponse {
    match handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.sqlite_path = dir.path().join("server.db").to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn test_health_is_logged_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let services = Services::build(&config).await;
        let app = create_router(&services, &config, None);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert!(response.headers().contains_key("x-response-time"));

        services.registry.flush().await;
        let store = services.registry.embedded().unwrap();
        let rows = store.recent_requests(10, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].log.path, "/health");
        services.close().await;
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let services = Services::build(&config).await;
        let app = create_router(&services, &config, None);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_with_local_handle() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let services = Services::build(&config).await;
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let app = create_router(&services, &config, Some(Arc::new(handle)));

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
