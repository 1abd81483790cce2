use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error-facet marker a handler response can carry so the request-logging
/// middleware records it on the inbound row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
}

/// Errors surfaced by the outbound call client
#[derive(Debug, Error)]
pub enum CallError {
    /// Transport failure or timeout talking to the vendor
    #[error("External call to {vendor} failed: {message}")]
    ExternalCallFailed { vendor: String, message: String },
    /// Circuit breaker open and no fallback configured
    #[error("Service {vendor} is temporarily unavailable")]
    ServiceUnavailable { vendor: String },
}

/// Errors raised inside storage plumbing. These never cross a backend's
/// `write_*` boundary; they are logged and turned into `false`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("backend rejected write ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

/// Application error types for the admin and server layer
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Call(#[from] CallError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::ConfigError(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Call(CallError::ExternalCallFailed { .. }) => StatusCode::BAD_GATEWAY,
            Self::Call(CallError::ServiceUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let error_type = error_type_name(&self);
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(HandlerError {
            error_type: error_type.to_string(),
            message,
        });
        response
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::ConfigError(_) => "config_error",
        AppError::NotFound(_) => "not_found",
        AppError::BadRequest(_) => "bad_request",
        AppError::Storage(_) => "storage_error",
        AppError::Call(CallError::ExternalCallFailed { .. }) => "external_call_failed",
        AppError::Call(CallError::ServiceUnavailable { .. }) => "service_unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::NotFound("request abc".to_string());
        assert_eq!(err.to_string(), "Not found: request abc");

        let err = CallError::ServiceUnavailable {
            vendor: "weather".to_string(),
        };
        assert_eq!(err.to_string(), "Service weather is temporarily unavailable");
    }

    #[test]
    fn test_call_error_status_codes() {
        let resp = AppError::from(CallError::ExternalCallFailed {
            vendor: "weather".to_string(),
            message: "timeout".to_string(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = AppError::from(CallError::ServiceUnavailable {
            vendor: "weather".to_string(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_into_response_attaches_handler_error() {
        let resp = AppError::BadRequest("limit must be positive".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let marker = resp.extensions().get::<HandlerError>().unwrap();
        assert_eq!(marker.error_type, "bad_request");
        assert!(marker.message.contains("limit must be positive"));
    }
}
