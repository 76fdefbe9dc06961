use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::error::ErrorKind;
use crate::model::SourceStatus;

struct EngineMetrics {
    sources: Counter<u64>,
    source_duration_ms: Histogram<f64>,
    retries: Counter<u64>,
    requests: Counter<u64>,
    request_duration_ms: Histogram<f64>,
}

static METRICS: OnceCell<EngineMetrics> = OnceCell::new();

fn handles() -> &'static EngineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deeptree.engine");
        EngineMetrics {
            sources: meter
                .u64_counter("deeptree_sources_total")
                .with_description("Processed sources by terminal status")
                .init(),
            source_duration_ms: meter
                .f64_histogram("deeptree_source_duration_ms")
                .with_description("Fetch plus analysis time per source in milliseconds")
                .init(),
            retries: meter
                .u64_counter("deeptree_call_retries_total")
                .with_description("Outbound call retries by operation and error kind")
                .init(),
            requests: meter
                .u64_counter("deeptree_requests_total")
                .with_description("Research requests by outcome")
                .init(),
            request_duration_ms: meter
                .f64_histogram("deeptree_request_duration_ms")
                .with_description("End-to-end research request time in milliseconds")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("DEEPTREE_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPTREE_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export engine metrics."
        );
    }
}

/// Record one source reaching a terminal status (no-op if no provider installed).
pub fn record_source(status: SourceStatus, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.as_str())];
    metrics.sources.add(1, &attrs);
    metrics.source_duration_ms.record(duration_ms as f64, &attrs);
}

pub fn record_retry(operation: &'static str, kind: ErrorKind) {
    let attrs = [
        KeyValue::new("operation", operation),
        KeyValue::new("error_kind", kind.as_str()),
    ];
    handles().retries.add(1, &attrs);
}

pub fn record_request(outcome: &'static str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("outcome", outcome)];
    metrics.requests.add(1, &attrs);
    metrics.request_duration_ms.record(duration_ms as f64, &attrs);
}
