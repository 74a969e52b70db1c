use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: Prometheus text exposition of the worker's counters.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the worker emits.
pub fn describe_metrics() {
    metrics::describe_counter!("jobs_claimed_total", "Jobs claimed by this worker");
    metrics::describe_counter!("jobs_completed_total", "Jobs marked done");
    metrics::describe_counter!("jobs_requeued_total", "Failed jobs re-queued with backoff");
    metrics::describe_counter!("jobs_failed_total", "Jobs that failed terminally");
    metrics::describe_counter!("jobs_skipped_total", "Jobs of unknown type completed as no-ops");
    metrics::describe_counter!("assets_persisted_total", "Assets written to storage and recorded");
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from claim to recorded outcome, by job type"
    );
    metrics::describe_gauge!("jobs_queue_depth", "Queued jobs eligible for claiming");
}
