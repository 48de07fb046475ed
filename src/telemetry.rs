//! Logging and metrics setup shared by both binaries.

use tracing_subscriber::EnvFilter;

/// JSON logs filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for every metric the pipeline records.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "scoring_job_events_total",
        "Lifecycle events observed, labelled by kind"
    );
    metrics::describe_counter!("scoring_jobs_created_total", "Scoring jobs created");
    metrics::describe_counter!("scoring_jobs_completed_total", "Scoring jobs completed");
    metrics::describe_counter!(
        "scoring_jobs_retried_total",
        "Failed attempts handed back for retry"
    );
    metrics::describe_counter!(
        "scoring_jobs_failed_total",
        "Scoring jobs that exhausted their attempts"
    );
    metrics::describe_counter!(
        "scoring_jobs_reaped_total",
        "Orphaned RUNNING jobs returned to the queue"
    );
    metrics::describe_counter!(
        "scoring_events_dropped_total",
        "Lifecycle events discarded because the channel was full"
    );
    metrics::describe_histogram!(
        "scoring_job_duration_seconds",
        "Time from claim to persisted score"
    );
    metrics::describe_gauge!(
        "scoring_queue_depth",
        "Deliveries waiting in the queue"
    );
}
