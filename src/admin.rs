use crate::circuit_breaker::CircuitBreakers;
use crate::error::AppError;
use crate::registry::LogRegistry;
use crate::storage::SqliteBackend;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<LogRegistry>,
    pub breakers: Arc<CircuitBreakers>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestListQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub include_bodies: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallListQuery {
    pub limit: Option<i64>,
    pub vendor: Option<String>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn embedded(state: &AdminState) -> Result<Arc<SqliteBackend>, AppError> {
    state
        .registry
        .embedded()
        .ok_or_else(|| AppError::ConfigError("embedded log store is not enabled".to_string()))
}

/// GET /admin/logs/requests
pub async fn list_requests(
    State(state): State<AdminState>,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<Value>, AppError> {
    let store = embedded(&state)?;
    let rows = store
        .recent_requests(clamp_limit(query.limit), query.include_bodies)
        .await?;
    Ok(Json(json!({
        "count": rows.len(),
        "include_bodies": query.include_bodies,
        "requests": rows,
    })))
}

/// GET /admin/logs/requests/:request_id
pub async fn get_request(
    State(state): State<AdminState>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store = embedded(&state)?;
    let row = store
        .request_by_request_id(&request_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request {request_id}")))?;
    let calls = store.calls_for_correlation(&row.log.correlation_id).await?;

    Ok(Json(json!({
        "request": row,
        "calls": calls,
    })))
}

/// GET /admin/logs/calls
pub async fn list_calls(
    State(state): State<AdminState>,
    Query(query): Query<CallListQuery>,
) -> Result<Json<Value>, AppError> {
    let store = embedded(&state)?;
    let rows = store
        .recent_calls(clamp_limit(query.limit), query.vendor.as_deref())
        .await?;
    Ok(Json(json!({
        "count": rows.len(),
        "calls": rows,
    })))
}

/// GET /admin/logs/db-info
pub async fn db_info(State(state): State<AdminState>) -> Result<Json<Value>, AppError> {
    let stats = match state.registry.embedded() {
        Some(store) => Some(store.stats().await?),
        None => None,
    };
    Ok(Json(json!({
        "backends": state.registry.active_backends(),
        "embedded": stats,
    })))
}

/// GET /admin/circuits
pub async fn circuits(State(state): State<AdminState>) -> Json<Value> {
    let circuits: serde_json::Map<String, Value> = state
        .breakers
        .states()
        .into_iter()
        .map(|(vendor, circuit)| (vendor, Value::String(circuit.as_str().to_string())))
        .collect();
    Json(json!({ "circuits": circuits }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::fixtures;
    use crate::storage::LogBackend;
    use std::time::Duration;

    async fn state_with_rows() -> AdminState {
        let store = Arc::new(SqliteBackend::open(":memory:").await.unwrap());
        let mut first = fixtures::inbound("req-1");
        first.correlation_id = "corr-1".to_string();
        store.write_inbound(&first).await;
        store.write_inbound(&fixtures::inbound("req-2")).await;

        let mut call = fixtures::outbound("call-1", "weather");
        call.correlation_id = "corr-1".to_string();
        store.write_outbound(&call).await;

        let backends: Vec<Arc<dyn LogBackend>> = vec![store.clone()];
        let registry = LogRegistry::with_backends(backends, None).with_embedded(store);
        AdminState {
            registry: Arc::new(registry),
            breakers: Arc::new(CircuitBreakers::new()),
        }
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(5000)), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_list_requests_newest_first_without_bodies() {
        let state = state_with_rows().await;
        let Json(body) = list_requests(State(state), Query(RequestListQuery::default()))
            .await
            .unwrap();

        assert_eq!(body["count"], 2);
        assert_eq!(body["requests"][0]["request_id"], "req-2");
        assert!(body["requests"][0]["response_body"].is_null());
    }

    #[tokio::test]
    async fn test_get_request_includes_related_calls() {
        let state = state_with_rows().await;
        let Json(body) = get_request(State(state.clone()), Path("req-1".to_string()))
            .await
            .unwrap();
        assert_eq!(body["request"]["request_id"], "req-1");
        assert_eq!(body["calls"][0]["call_id"], "call-1");

        let missing = get_request(State(state), Path("nope".to_string())).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_calls_and_db_info() {
        let state = state_with_rows().await;
        let Json(calls) = list_calls(
            State(state.clone()),
            Query(CallListQuery {
                limit: Some(10),
                vendor: Some("weather".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(calls["count"], 1);

        let Json(info) = db_info(State(state)).await.unwrap();
        assert_eq!(info["backends"][0], "sqlite");
        assert_eq!(info["embedded"]["inbound_rows"], 2);
        assert_eq!(info["embedded"]["outbound_rows"], 1);
    }

    #[tokio::test]
    async fn test_no_embedded_store_is_an_error() {
        let state = AdminState {
            registry: Arc::new(LogRegistry::with_backends(Vec::new(), None)),
            breakers: Arc::new(CircuitBreakers::new()),
        };
        let result = list_calls(State(state), Query(CallListQuery::default())).await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_circuits_lists_breaker_states() {
        let breakers = Arc::new(CircuitBreakers::new());
        breakers
            .get_or_create("weather", 1, Duration::from_secs(30))
            .record_failure();
        let state = AdminState {
            registry: Arc::new(LogRegistry::with_backends(Vec::new(), None)),
            breakers,
        };
        let Json(body) = circuits(State(state)).await;
        assert_eq!(body["circuits"]["weather"], "open");
    }
}
