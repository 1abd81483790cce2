//! DynamoDB backend.
//!
//! Writes go straight to the JSON `PutItem` API over reqwest, signed with
//! SigV4. Every item gets a partition key `pk` (`REQUEST#<id>` or
//! `CALL#<id>`) and a sort key `sk` built from the timestamp plus a uuid.

use crate::config::DynamoConfig;
use crate::error::StorageError;
use crate::storage::models::{InboundRequestLog, OutboundCallLog};
use crate::storage::schema::format_timestamp;
use crate::storage::sigv4::{self, Credentials};
use crate::storage::{record_write, LogBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::OnceCell;

const PUT_ITEM_TARGET: &str = "DynamoDB_20120810.PutItem";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

struct Connection {
    http: Client,
    endpoint: url::Url,
    credentials: Credentials,
}

pub struct DynamoBackend {
    config: DynamoConfig,
    connection: OnceCell<Connection>,
}

impl DynamoBackend {
    pub fn new(config: DynamoConfig) -> Self {
        Self {
            config,
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<&Connection, StorageError> {
        self.connection
            .get_or_try_init(|| async {
                let raw = self
                    .config
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| format!("https://dynamodb.{}.amazonaws.com/", self.config.region));
                let endpoint = url::Url::parse(&raw)
                    .map_err(|e| StorageError::NotConfigured(format!("dynamodb endpoint {}: {}", raw, e)))?;

                let credentials = Credentials::resolve(
                    self.config.access_key_id.as_deref(),
                    self.config.secret_access_key.as_deref(),
                    self.config.session_token.as_deref(),
                )
                .ok_or_else(|| StorageError::NotConfigured("aws credentials".to_string()))?;

                let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
                tracing::debug!(endpoint = %endpoint, "Connecting DynamoDB client");

                Ok::<_, StorageError>(Connection {
                    http,
                    endpoint,
                    credentials,
                })
            })
            .await
    }

    async fn put_item(&self, item: Map<String, Value>) -> Result<(), StorageError> {
        let table = self
            .config
            .table
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured("dynamodb table".to_string()))?;
        let conn = self.connection().await?;

        let body = serde_json::to_vec(&json!({
            "TableName": table,
            "Item": item,
        }))?;

        let target_header = [("x-amz-target", PUT_ITEM_TARGET)];
        let signed = sigv4::sign(
            "POST",
            &conn.endpoint,
            &target_header,
            &body,
            &conn.credentials,
            &self.config.region,
            "dynamodb",
            Utc::now(),
        );

        let mut request = conn
            .http
            .post(conn.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", PUT_ITEM_TARGET)
            .body(body);
        for (name, value) in signed {
            request = request.header(name, value);
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

/// JSON value to a DynamoDB attribute value
pub fn attribute_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.iter().map(attribute_value).collect::<Vec<_>>() }),
        Value::Object(map) => {
            let converted: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), attribute_value(v)))
                .collect();
            json!({ "M": converted })
        }
    }
}

fn build_item<T: serde::Serialize>(
    log: &T,
    partition_key: String,
    timestamp: &DateTime<Utc>,
    log_type: &str,
) -> Result<Map<String, Value>, StorageError> {
    let timestamp = format_timestamp(timestamp);
    let mut item = Map::new();
    item.insert("pk".to_string(), json!({ "S": partition_key }));
    item.insert(
        "sk".to_string(),
        json!({ "S": format!("{}#{}", timestamp, uuid::Uuid::new_v4()) }),
    );
    item.insert("log_type".to_string(), json!({ "S": log_type }));

    if let Value::Object(fields) = serde_json::to_value(log)? {
        for (key, value) in fields {
            item.insert(key, attribute_value(&value));
        }
    }
    item.insert("timestamp".to_string(), json!({ "S": timestamp }));
    Ok(item)
}

#[async_trait]
impl LogBackend for DynamoBackend {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    fn is_available(&self) -> bool {
        self.config.table.is_some()
    }

    async fn write_inbound(&self, log: &InboundRequestLog) -> bool {
        let result = match build_item(log, format!("REQUEST#{}", log.request_id), &log.timestamp, "inbound") {
            Ok(item) => self.put_item(item).await,
            Err(e) => Err(e),
        };
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = "dynamodb", request_id = %log.request_id, error = %e, "Failed to write inbound request log");
                false
            }
        };
        record_write(self.name(), "inbound", ok);
        ok
    }

    async fn write_outbound(&self, log: &OutboundCallLog) -> bool {
        let result = match build_item(log, format!("CALL#{}", log.call_id), &log.timestamp, "outbound") {
            Ok(mut item) => {
                item.insert("status".to_string(), json!({ "S": log.status() }));
                self.put_item(item).await
            }
            Err(e) => Err(e),
        };
        let ok = match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = "dynamodb", call_id = %log.call_id, error = %e, "Failed to write outbound call log");
                false
            }
        };
        record_write(self.name(), "outbound", ok);
        ok
    }

    async fn close(&self) {
        tracing::debug!("DynamoDB backend closed");
    }
}
