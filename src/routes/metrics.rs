use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus scrape endpoint for the job and worker pool metrics.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the worker process emits.
pub fn describe_metrics() {
    metrics::describe_counter!("jobs_submitted_total", "Jobs created and enqueued");
    metrics::describe_counter!("jobs_started_total", "Job executions that entered running");
    metrics::describe_counter!(
        "jobs_finished_total",
        "Job executions by outcome (completed, failed, cancelled)"
    );
    metrics::describe_counter!("job_batches_total", "Processed batches by result");
    metrics::describe_histogram!("job_batch_duration_seconds", "Time spent in one batch");
    metrics::describe_gauge!("worker_pool_busy", "Consumers currently running a job");
    metrics::describe_counter!("worker_pool_restarts_total", "Supervisor-driven pool restarts");
    metrics::describe_gauge!("queue_depth", "Waiting plus delayed messages in the queue");
}
