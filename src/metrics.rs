use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and register metric descriptions
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    init_metric_descriptions();
    Ok(handle)
}

fn init_metric_descriptions() {
    describe_counter!(
        "audit_backend_writes_total",
        "Log rows handed to a storage backend, by outcome"
    );
    describe_counter!(
        "audit_inbound_requests_total",
        "Inbound requests observed by the logging middleware"
    );
    describe_counter!(
        "audit_outbound_calls_total",
        "Outbound call attempts made through the logging client"
    );
    describe_histogram!(
        "audit_outbound_call_duration_seconds",
        "Outbound call duration in seconds"
    );
    describe_counter!(
        "audit_circuit_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_gauge!("audit_info", "Build information");

    gauge!("audit_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_backend_write(backend: &str, kind: &str, ok: bool) {
    let status = if ok { "ok" } else { "failed" };
    counter!(
        "audit_backend_writes_total",
        "backend" => backend.to_string(),
        "kind" => kind.to_string(),
        "status" => status,
    )
    .increment(1);
}

pub fn record_inbound(method: &str, status: u16) {
    counter!(
        "audit_inbound_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

pub fn record_outbound(vendor: &str, outcome: &str, duration: Duration) {
    counter!(
        "audit_outbound_calls_total",
        "vendor" => vendor.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    histogram!(
        "audit_outbound_call_duration_seconds",
        "vendor" => vendor.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_circuit_transition(vendor: &str, state: &str) {
    counter!(
        "audit_circuit_transitions_total",
        "vendor" => vendor.to_string(),
        "state" => state.to_string(),
    )
    .increment(1);
}
