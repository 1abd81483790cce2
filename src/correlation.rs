//! Request-scoped correlation context
//!
//! Each inbound request runs inside its own [`scope`], backed by a tokio
//! task-local. Concurrent requests never observe each other's ids, and
//! code outside any scope simply sees `None`.

use axum::http::HeaderMap;
use std::cell::RefCell;
use std::future::Future;

/// Headers consulted after the configured correlation header, in order
pub const FALLBACK_CORRELATION_HEADERS: [&str; 4] =
    ["X-Request-ID", "X-Trace-ID", "Request-ID", "Trace-ID"];

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Debug, Clone, Default)]
struct CorrelationSlot {
    correlation_id: Option<String>,
    request_id: Option<String>,
}

tokio::task_local! {
    static CORRELATION: RefCell<CorrelationSlot>;
}

/// New random 128-bit id in hyphenated form (36 chars)
pub fn generate() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Correlation id bound to the current scope, if any
pub fn current() -> Option<String> {
    CORRELATION
        .try_with(|slot| slot.borrow().correlation_id.clone())
        .ok()
        .flatten()
}

/// Inbound request id bound to the current scope, if any
pub fn current_request_id() -> Option<String> {
    CORRELATION
        .try_with(|slot| slot.borrow().request_id.clone())
        .ok()
        .flatten()
}

/// Bind `id` for the remainder of the current scope.
///
/// Returns `false` when called outside a scope; nothing is stored then.
pub fn bind(id: impl Into<String>) -> bool {
    let id = id.into();
    CORRELATION
        .try_with(|slot| slot.borrow_mut().correlation_id = Some(id))
        .is_ok()
}

/// Drop every id bound in the current scope
pub fn clear() {
    let _ = CORRELATION.try_with(|slot| *slot.borrow_mut() = CorrelationSlot::default());
}

/// Run `fut` inside a fresh correlation scope.
pub async fn scope<F>(correlation_id: Option<String>, request_id: Option<String>, fut: F) -> F::Output
where
    F: Future,
{
    let slot = CorrelationSlot {
        correlation_id,
        request_id,
    };
    CORRELATION.scope(RefCell::new(slot), fut).await
}

/// Resolve an inbound correlation id: configured header first, then the
/// generic request/trace headers. Blank values are skipped.
pub fn from_headers(headers: &HeaderMap, custom_header: &str) -> Option<String> {
    std::iter::once(custom_header)
        .chain(FALLBACK_CORRELATION_HEADERS)
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_generate_is_uuid_shaped() {
        let id = generate();
        assert_eq!(id.len(), 36);
        assert_ne!(id, generate());
    }

    #[test]
    fn test_outside_scope() {
        assert_eq!(current(), None);
        assert!(!bind("orphan"));
        assert_eq!(current(), None);
        clear();
    }

    #[tokio::test]
    async fn test_bind_and_clear_within_scope() {
        scope(None, Some("req-1".to_string()), async {
            assert_eq!(current(), None);
            assert!(bind("abc-123"));
            assert_eq!(current().as_deref(), Some("abc-123"));
            assert_eq!(current_request_id().as_deref(), Some("req-1"));
            clear();
            assert_eq!(current(), None);
            assert_eq!(current_request_id(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = tokio::spawn(scope(Some("a".to_string()), None, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            current()
        }));
        let b = tokio::spawn(scope(Some("b".to_string()), None, async {
            bind("b-rebound");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            current()
        }));

        assert_eq!(a.await.unwrap().as_deref(), Some("a"));
        assert_eq!(b.await.unwrap().as_deref(), Some("b-rebound"));
    }

    #[test]
    fn test_header_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("Trace-ID", HeaderValue::from_static("trace"));
        headers.insert("X-Request-ID", HeaderValue::from_static("xreq"));
        assert_eq!(from_headers(&headers, "X-Correlation-ID").as_deref(), Some("xreq"));

        headers.insert("X-Correlation-ID", HeaderValue::from_static("abc-123"));
        assert_eq!(
            from_headers(&headers, "X-Correlation-ID").as_deref(),
            Some("abc-123")
        );

        headers.insert("X-Tenant-Trace", HeaderValue::from_static("custom"));
        assert_eq!(from_headers(&headers, "X-Tenant-Trace").as_deref(), Some("custom"));
    }

    #[test]
    fn test_blank_header_is_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Correlation-ID", HeaderValue::from_static("  "));
        headers.insert("X-Trace-ID", HeaderValue::from_static("t-1"));
        assert_eq!(from_headers(&headers, "X-Correlation-ID").as_deref(), Some("t-1"));
        assert_eq!(from_headers(&HeaderMap::new(), "X-Correlation-ID"), None);
    }
}
