//! Lifecycle events of scoring jobs.
//!
//! The producer and the worker report every transition to an [`EventSink`].
//! The sink never blocks: when the channel is full the event is dropped and
//! counted, so a slow observer cannot stall job processing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Claimed {
        attempt: u32,
    },
    Completed {
        score: i32,
        duration_ms: u64,
    },
    Retrying {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Failed {
        attempts: u32,
        reason: String,
    },
    /// Delivery acknowledged without work: already done, terminal, or claimed elsewhere.
    Skipped {
        reason: String,
    },
    /// Delivery referenced a job that does not exist.
    Dropped,
    /// The broker lock could not be renewed while scoring.
    LockLost,
    /// An orphaned `RUNNING` job was returned to the queue.
    Reaped,
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Created => "created",
            JobEventKind::Claimed { .. } => "claimed",
            JobEventKind::Completed { .. } => "completed",
            JobEventKind::Retrying { .. } => "retrying",
            JobEventKind::Failed { .. } => "failed",
            JobEventKind::Skipped { .. } => "skipped",
            JobEventKind::Dropped => "dropped",
            JobEventKind::LockLost => "lock_lost",
            JobEventKind::Reaped => "reaped",
        }
    }
}

/// Sending half of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<JobEvent>>,
    overflowed: Arc<AtomicU64>,
}

impl EventSink {
    /// A bounded channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            overflowed: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            overflowed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, job_id: Uuid, kind: JobEventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = JobEvent {
            job_id,
            at: Utc::now(),
            kind,
        };
        // A closed channel means the observer is gone; nothing to count.
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("scoring_events_dropped_total").increment(1);
            tracing::debug!(
                job_id = %event.job_id,
                kind = event.kind.name(),
                "Event channel full"
            );
        }
    }

    /// Events discarded because the channel was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

/// Drain `rx` into structured logs and metrics until every sink is dropped.
pub fn spawn_event_observer(mut rx: mpsc::Receiver<JobEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            observe(&event);
        }
        tracing::debug!("Event channel closed");
    })
}

fn observe(event: &JobEvent) {
    let kind = event.kind.name();
    metrics::counter!("scoring_job_events_total", "kind" => kind).increment(1);

    let job_id = event.job_id;
    match &event.kind {
        JobEventKind::Created => {
            metrics::counter!("scoring_jobs_created_total").increment(1);
            tracing::info!(%job_id, event = kind, "Scoring job created");
        }
        JobEventKind::Claimed { attempt } => {
            tracing::info!(%job_id, event = kind, attempt, "Scoring job claimed");
        }
        JobEventKind::Completed { score, duration_ms } => {
            metrics::counter!("scoring_jobs_completed_total").increment(1);
            metrics::histogram!("scoring_job_duration_seconds")
                .record(*duration_ms as f64 / 1000.0);
            tracing::info!(%job_id, event = kind, score, duration_ms, "Scoring job completed");
        }
        JobEventKind::Retrying {
            attempt,
            delay_ms,
            reason,
        } => {
            metrics::counter!("scoring_jobs_retried_total").increment(1);
            tracing::warn!(
                %job_id,
                event = kind,
                attempt,
                delay_ms,
                %reason,
                "Scoring job will retry"
            );
        }
        JobEventKind::Failed { attempts, reason } => {
            metrics::counter!("scoring_jobs_failed_total").increment(1);
            tracing::error!(%job_id, event = kind, attempts, %reason, "Scoring job failed");
        }
        JobEventKind::Skipped { reason } => {
            tracing::info!(%job_id, event = kind, %reason, "Delivery skipped");
        }
        JobEventKind::Dropped => {
            tracing::error!(%job_id, event = kind, "Delivery dropped: job record missing");
        }
        JobEventKind::LockLost => {
            tracing::warn!(%job_id, event = kind, "Delivery lock lost while scoring");
        }
        JobEventKind::Reaped => {
            metrics::counter!("scoring_jobs_reaped_total").increment(1);
            tracing::warn!(%job_id, event = kind, "Orphaned job returned to queue");
        }
    }
}
