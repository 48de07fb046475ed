use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{PgJobStore, PgSubmissionStore};
use crate::services::events::EventSink;
use crate::services::job_store::{JobStore, MemoryJobStore};
use crate::services::producer::JobProducer;
use crate::services::queue::{Broker, MemoryBroker, QueueError, RedisBroker};
use crate::services::submissions::{MemorySubmissionStore, SubmissionService, SubmissionStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub producer: JobProducer,
    pub submission_service: SubmissionService,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        submissions: Arc<dyn SubmissionStore>,
        broker: Arc<dyn Broker>,
        events: EventSink,
    ) -> Self {
        let producer = JobProducer::new(
            Arc::clone(&submissions),
            Arc::clone(&jobs),
            Arc::clone(&broker),
            events,
        );
        let submission_service = SubmissionService::new(submissions);
        Self {
            jobs,
            broker,
            producer,
            submission_service,
        }
    }

    /// Postgres stores and the Redis broker.
    pub fn connect(config: &AppConfig, db: PgPool, events: EventSink) -> Result<Self, QueueError> {
        let broker = RedisBroker::new(&config.redis_url, &config.broker())?;
        Ok(Self::new(
            Arc::new(PgJobStore::new(db.clone())),
            Arc::new(PgSubmissionStore::new(db)),
            Arc::new(broker),
            events,
        ))
    }

    /// Everything in process memory.
    pub fn in_memory(broker: Arc<MemoryBroker>, events: EventSink) -> Self {
        Self::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemorySubmissionStore::new()),
            broker,
            events,
        )
    }
}
