use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use submission_scoring::{
    config::AppConfig,
    db::{self, PgJobStore, PgSubmissionStore},
    services::{
        events::{spawn_event_observer, EventSink},
        job_store::JobStore,
        queue::{Broker, RedisBroker},
        reaper::StaleJobReaper,
        scorer::RubricScorer,
        submissions::SubmissionStore,
        worker::{ScoringWorker, WorkerPool},
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    telemetry::init_tracing();

    tracing::info!("Starting scoring worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Prometheus scrape endpoint for the lifecycle metrics this process records
    match config.worker_metrics_addr() {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .expect("Failed to install Prometheus exporter");
            telemetry::describe_metrics();
            tracing::info!(%addr, "Metrics exporter listening");
        }
        None => tracing::info!("Metrics exporter disabled"),
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, &config.pool())
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let submissions: Arc<dyn SubmissionStore> = Arc::new(PgSubmissionStore::new(db_pool));
    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::new(&config.redis_url, &config.broker())
            .expect("Failed to initialize scoring queue"),
    );
    let scorer = Arc::new(RubricScorer::new(config.rubric_weights()));

    let (events, event_rx) = EventSink::channel(config.event_buffer);
    let observer = spawn_event_observer(event_rx);

    let worker = Arc::new(ScoringWorker::new(
        Arc::clone(&jobs),
        Arc::clone(&broker),
        scorer,
        events.clone(),
        config.worker(),
    ));
    let reaper = config.reaper().map(|reaper_config| {
        StaleJobReaper::new(jobs, submissions, broker, events.clone(), reaper_config)
    });

    tracing::info!(
        queue = %config.queue_name,
        concurrency = worker.config().concurrency,
        max_attempts = worker.config().max_attempts,
        "Worker ready, starting job processing"
    );
    let handle = WorkerPool::start(worker, reaper);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, draining in-flight deliveries");
    handle.stop().await;

    let overflowed = events.overflowed();
    if overflowed > 0 {
        tracing::warn!(overflowed, "Lifecycle events were dropped on a full channel");
    }

    // Close the event channel so the observer drains and exits.
    drop(events);
    if let Err(e) = observer.await {
        tracing::error!(error = %e, "Event observer terminated abnormally");
    }
}
