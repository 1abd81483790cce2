//! Document-store backend speaking a Data-API style HTTP interface
//! (`POST {endpoint}/action/insertOne`).

use crate::config::DocumentStoreConfig;
use crate::error::StorageError;
use crate::storage::models::{InboundRequestLog, OutboundCallLog};
use crate::storage::schema::{format_timestamp, INBOUND_TABLE, OUTBOUND_TABLE};
use crate::storage::{record_write, LogBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DocumentBackend {
    config: DocumentStoreConfig,
    client: OnceCell<Client>,
}

impl DocumentBackend {
    pub fn new(config: DocumentStoreConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, StorageError> {
        self.client
            .get_or_try_init(|| async {
                tracing::debug!(database = %self.config.database, "Connecting document store client");
                Client::builder()
                    .timeout(REQUEST_TIMEOUT)
                    .build()
                    .map_err(StorageError::from)
            })
            .await
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<(), StorageError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured("document store endpoint".to_string()))?;
        let url = format!("{}/action/insertOne", endpoint.trim_end_matches('/'));

        let payload = json!({
            "dataSource": self.config.data_source,
            "database": self.config.database,
            "collection": collection,
            "document": document,
        });

        let mut request = self.client().await?.post(&url).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Serialize a log row into a document, keeping the timestamp in sortable text form
fn to_document<T: serde::Serialize>(
    log: &T,
    timestamp: &chrono::DateTime<chrono::Utc>,
) -> Result<Value, StorageError> {
    let mut document = serde_json::to_value(log)?;
    if let Value::Object(map) = &mut document {
        map.insert("timestamp".to_string(), Value::String(format_timestamp(timestamp)));
    }
    Ok(document)
}

#[async_trait]
impl LogBackend for DocumentBackend {
    fn name(&self) -> &'static str {
        "document"
    }

    fn is_available(&self) -> bool {
        self.config.endpoint.is_some()
    }

    async fn write_inbound(&self, log: &InboundRequestLog) -> bool {
        let result = match to_document(log, &log.timestamp) {
            Ok(document) => self.insert_one(INBOUND_TABLE, document).await,
            Err(e) => Err(e),
        };
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = "document", request_id = %log.request_id, error = %e, "Failed to write inbound request log");
                false
            }
        };
        record_write(self.name(), "inbound", ok);
        ok
    }

    async fn write_outbound(&self, log: &OutboundCallLog) -> bool {
        let result = match to_document(log, &log.timestamp) {
            Ok(mut document) => {
                if let Value::Object(map) = &mut document {
                    map.insert("status".to_string(), Value::String(log.status().to_string()));
                }
                self.insert_one(OUTBOUND_TABLE, document).await
            }
            Err(e) => Err(e),
        };
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = "document", call_id = %log.call_id, error = %e, "Failed to write outbound call log");
                false
            }
        };
        record_write(self.name(), "outbound", ok);
        ok
    }

    async fn close(&self) {
        tracing::debug!("Document store backend closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::fixtures;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> DocumentStoreConfig {
        DocumentStoreConfig {
            enabled: true,
            endpoint: Some(format!("{}/app/data-abc/endpoint/data/v1", server.uri())),
            api_key: Some("doc-key".to_string()),
            data_source: "Cluster0".to_string(),
            database: "api_logs".to_string(),
        }
    }

    #[test]
    fn test_unavailable_without_endpoint() {
        let backend = DocumentBackend::new(DocumentStoreConfig::default());
        assert!(!backend.is_available());
    }

    #[tokio::test]
    async fn test_write_outbound_inserts_document() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/data-abc/endpoint/data/v1/action/insertOne"))
            .and(header("api-key", "doc-key"))
            .and(body_partial_json(json!({
                "database": "api_logs",
                "collection": "api_calls",
                "document": {"call_id": "c1", "vendor": "weather", "status": "SUCCESS"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"insertedId": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = DocumentBackend::new(config_for(&server));
        assert!(backend.is_available());
        assert!(backend.write_outbound(&fixtures::outbound("c1", "weather")).await);
    }

    #[tokio::test]
    async fn test_write_inbound_uses_request_collection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "collection": "app_requests",
                "document": {"request_id": "r1", "path": "/items"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = DocumentBackend::new(config_for(&server));
        assert!(backend.write_inbound(&fixtures::inbound("r1")).await);
    }

    #[tokio::test]
    async fn test_server_error_returns_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let backend = DocumentBackend::new(config_for(&server));
        assert!(!backend.write_inbound(&fixtures::inbound("r1")).await);
    }
}
