//! At-least-once delivery queue for scoring jobs.
//!
//! Deliveries are keyed by job id, so enqueueing a job that already has a
//! pending or in-flight delivery is a no-op. A dequeued delivery is hidden
//! behind a visibility lock; if the lock is neither renewed nor released
//! before it expires the delivery becomes visible again and will be handed
//! to another worker.
//!
//! Every lock carries a token. `ack`, `renew_lock` and `retry` only take
//! effect while the caller's token is still the current one.

mod memory_broker;
mod redis_broker;

pub use memory_broker::MemoryBroker;
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::ScoringPayload;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Prefix of every key the broker owns.
    pub queue_name: String,
    /// How long a dequeued delivery stays invisible to other workers.
    pub lock_duration: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_name: "scoring-queue".to_string(),
            lock_duration: Duration::from_secs(30),
        }
    }
}

/// A leased message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: ScoringPayload,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub(crate) token: String,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.payload.job_id
    }
}

/// Queue counts for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Visible and ready to be dequeued.
    pub waiting: u64,
    /// Scheduled for a later retry.
    pub delayed: u64,
    /// Leased by a worker.
    pub active: u64,
    /// Deliveries ever created (idempotent no-ops excluded).
    pub enqueued_total: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a delivery keyed by the payload's job id. Returns `false`
    /// when one is already pending or in flight.
    async fn enqueue(&self, payload: &ScoringPayload) -> Result<bool, QueueError>;

    /// Lease the next visible delivery, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove the delivery for good.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Extend the visibility lock. `false` means the lock was lost.
    async fn renew_lock(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Release the lock without acknowledging; the delivery becomes visible
    /// again after `delay`.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError>;

    /// Whether some worker currently holds a live lock on the job's delivery.
    async fn is_locked(&self, job_id: Uuid) -> Result<bool, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

pub(crate) fn new_lock_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed delivery: {0}")]
    Malformed(String),
}
