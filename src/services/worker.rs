//! Scoring worker: the job lifecycle state machine and the executor pool.
//!
//! A delivery may reach several executors at once (lock expiry, lost acks,
//! crashes). The claim `QUEUED -> RUNNING` through
//! [`JobStore::transition_if_status`] decides which one does the work; broker
//! locks only make collisions rarer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::error::ScoringError;
use crate::models::job::{JobStatus, JobUpdate};
use crate::services::events::{EventSink, JobEventKind};
use crate::services::job_store::JobStore;
use crate::services::queue::{backoff_delay, Broker, Delivery};
use crate::services::reaper::StaleJobReaper;
use crate::services::scorer::{ScoreResult, Scorer};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executors pulling from the broker.
    pub concurrency: usize,
    /// Claims per job before it is marked `ERROR`.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How often the lock is renewed while scoring.
    pub lock_renew_interval: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            lock_renew_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Scored and persisted as `DONE`.
    Completed { score: i32 },
    /// Redelivery of a job that is already `DONE`; nothing recomputed.
    AlreadyDone,
    /// Redelivery of a job in `ERROR`.
    AlreadyTerminal,
    /// Another executor owns the job.
    ClaimLost,
    /// Released for another attempt after `delay`.
    Retrying { delay: Duration },
    /// Attempts exhausted; the job is now `ERROR`.
    Failed { attempts: u32 },
    /// The job record does not exist.
    Dropped,
}

pub struct ScoringWorker {
    jobs: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    scorer: Arc<dyn Scorer>,
    events: EventSink,
    config: WorkerConfig,
}

impl ScoringWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        scorer: Arc<dyn Scorer>,
        events: EventSink,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            broker,
            scorer,
            events,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Lease one delivery and process it. `None` when the queue is empty.
    pub async fn poll_once(&self) -> Result<Option<DeliveryOutcome>, ScoringError> {
        match self.broker.dequeue().await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run the lifecycle state machine for one delivery.
    ///
    /// An `Err` means the outcome could not be recorded; the delivery is left
    /// to lock expiry and the stale-job reaper.
    pub async fn handle(&self, delivery: Delivery) -> Result<DeliveryOutcome, ScoringError> {
        let span = tracing::info_span!(
            "scoring_delivery",
            job_id = %delivery.job_id(),
            delivery_attempt = delivery.attempt,
        );
        self.process(delivery).instrument(span).await
    }

    async fn process(&self, delivery: Delivery) -> Result<DeliveryOutcome, ScoringError> {
        let job_id = delivery.job_id();

        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(
                    error = %ScoringError::DataIntegrityFault(job_id),
                    "Dropping delivery"
                );
                self.events.emit(job_id, JobEventKind::Dropped);
                self.broker.ack(&delivery).await?;
                return Ok(DeliveryOutcome::Dropped);
            }
            Err(e) => return self.after_failure(&delivery, e.into(), None).await,
        };

        match job.status {
            JobStatus::Done => {
                tracing::info!(score = ?job.score, "Job already scored, acknowledging redelivery");
                return self.skip(&delivery, "already done", DeliveryOutcome::AlreadyDone).await;
            }
            JobStatus::Error => {
                tracing::info!("Job already failed, acknowledging redelivery");
                return self
                    .skip(&delivery, "already failed", DeliveryOutcome::AlreadyTerminal)
                    .await;
            }
            // A RUNNING job is handled by the claim below, which fails while
            // another executor owns it.
            JobStatus::Queued | JobStatus::Running => {}
        }

        // Claims whose executor vanished were counted but never finished.
        if job.status == JobStatus::Queued && job.attempts >= self.config.max_attempts {
            return self.abandon(&delivery, job.attempts).await;
        }

        let attempt = job.attempts + 1;
        let claimed = match self
            .jobs
            .transition_if_status(job_id, JobStatus::Queued, JobUpdate::claim(attempt))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => return self.after_failure(&delivery, e.into(), None).await,
        };
        if !claimed {
            let lost = ScoringError::ClaimLost(job_id);
            tracing::info!(reason = %lost, "Skipping delivery");
            return self
                .skip(&delivery, "claimed by another worker", DeliveryOutcome::ClaimLost)
                .await;
        }
        self.events.emit(job_id, JobEventKind::Claimed { attempt });

        let started = std::time::Instant::now();
        let result = match self.score_with_renewal(&delivery).await {
            Ok(result) => result,
            Err(e) => return self.after_failure(&delivery, e, Some(attempt)).await,
        };

        let score = result.score;
        let written = match self
            .jobs
            .write(job_id, JobUpdate::complete(result.score, result.feedback))
            .await
        {
            Ok(written) => written,
            Err(e) => return self.after_failure(&delivery, e.into(), Some(attempt)).await,
        };
        if !written {
            tracing::warn!("Job reached a terminal state elsewhere, discarding result");
            return self
                .skip(&delivery, "finished elsewhere", DeliveryOutcome::AlreadyTerminal)
                .await;
        }

        if !self.broker.ack(&delivery).await? {
            tracing::warn!("Lock lost before ack; result is persisted");
        }
        self.events.emit(
            job_id,
            JobEventKind::Completed {
                score,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(DeliveryOutcome::Completed { score })
    }

    async fn skip(
        &self,
        delivery: &Delivery,
        reason: &str,
        outcome: DeliveryOutcome,
    ) -> Result<DeliveryOutcome, ScoringError> {
        self.broker.ack(delivery).await?;
        self.events.emit(
            delivery.job_id(),
            JobEventKind::Skipped {
                reason: reason.to_string(),
            },
        );
        Ok(outcome)
    }

    /// Run the scorer on the blocking pool, renewing the delivery lock until
    /// it returns.
    async fn score_with_renewal(&self, delivery: &Delivery) -> Result<ScoreResult, ScoringError> {
        let scorer = Arc::clone(&self.scorer);
        let content = delivery.payload.content.clone();
        let mut scoring = tokio::task::spawn_blocking(move || scorer.score(&content));

        let period = self.config.lock_renew_interval;
        let mut renew = interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lock_held = true;

        loop {
            tokio::select! {
                joined = &mut scoring => {
                    return match joined {
                        Ok(result) => result.map_err(ScoringError::from),
                        Err(e) => Err(ScoringError::TransientFailure(format!(
                            "scorer panicked: {e}"
                        ))),
                    };
                }
                _ = renew.tick(), if lock_held => {
                    match self.broker.renew_lock(delivery).await {
                        Ok(true) => tracing::trace!("Lock renewed"),
                        Ok(false) => {
                            // Keep scoring; the terminal write guard settles any race.
                            lock_held = false;
                            tracing::warn!("Lock lost while scoring");
                            self.events.emit(delivery.job_id(), JobEventKind::LockLost);
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to renew lock"),
                    }
                }
            }
        }
    }

    /// Terminate a `QUEUED` job that has used every claim without finishing.
    async fn abandon(
        &self,
        delivery: &Delivery,
        attempts: u32,
    ) -> Result<DeliveryOutcome, ScoringError> {
        let job_id = delivery.job_id();
        let reason = "last attempt never finished".to_string();
        let feedback = format!("failed after {attempts} attempts: {reason}");
        if !self
            .jobs
            .transition_if_status(job_id, JobStatus::Queued, JobUpdate::fail(feedback))
            .await?
        {
            return self
                .skip(delivery, "claimed by another worker", DeliveryOutcome::ClaimLost)
                .await;
        }
        self.broker.ack(delivery).await?;
        self.events.emit(job_id, JobEventKind::Failed { attempts, reason });
        Ok(DeliveryOutcome::Failed { attempts })
    }

    /// Retry with backoff, or mark the job `ERROR` once attempts run out.
    ///
    /// `claimed` holds the attempt number when this executor moved the job to
    /// `RUNNING` and must hand it back. Without a claim the job is not ours:
    /// it may only be failed while still `QUEUED`, and the broker's delivery
    /// count bounds the retries.
    async fn after_failure(
        &self,
        delivery: &Delivery,
        error: ScoringError,
        claimed: Option<u32>,
    ) -> Result<DeliveryOutcome, ScoringError> {
        let job_id = delivery.job_id();
        let attempt = claimed.unwrap_or(delivery.attempt);
        let reason = error.to_string();

        if attempt >= self.config.max_attempts {
            let fail = JobUpdate::fail(format!("failed after {attempt} attempts: {reason}"));
            let recorded = match claimed {
                Some(_) => self.jobs.write(job_id, fail).await?,
                None => {
                    self.jobs
                        .transition_if_status(job_id, JobStatus::Queued, fail)
                        .await?
                }
            };
            if !recorded {
                tracing::warn!(%reason, "Job is not ours to fail, leaving it as is");
                let outcome = match claimed {
                    Some(_) => DeliveryOutcome::AlreadyTerminal,
                    None => DeliveryOutcome::ClaimLost,
                };
                return self.skip(delivery, "owned elsewhere at failure", outcome).await;
            }
            self.broker.ack(delivery).await?;
            self.events.emit(
                job_id,
                JobEventKind::Failed {
                    attempts: attempt,
                    reason,
                },
            );
            return Ok(DeliveryOutcome::Failed { attempts: attempt });
        }

        if claimed.is_some()
            && !self
                .jobs
                .transition_if_status(job_id, JobStatus::Running, JobUpdate::Release)
                .await?
        {
            tracing::warn!("Job left RUNNING before release");
        }

        let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt);
        if !self.broker.retry(delivery, delay).await? {
            // Our lease is gone; make sure a delivery still exists for the job.
            self.broker.enqueue(&delivery.payload).await?;
        }
        self.events.emit(
            job_id,
            JobEventKind::Retrying {
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason,
            },
        );
        Ok(DeliveryOutcome::Retrying { delay })
    }
}

/// Starts executors (and optionally the reaper) and hands back a handle.
pub struct WorkerPool;

impl WorkerPool {
    pub fn start(worker: Arc<ScoringWorker>, reaper: Option<StaleJobReaper>) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let concurrency = worker.config.concurrency.max(1);

        let mut tasks: Vec<JoinHandle<()>> = (0..concurrency)
            .map(|executor| tokio::spawn(run_executor(executor, Arc::clone(&worker), rx.clone())))
            .collect();
        if let Some(reaper) = reaper {
            tasks.push(tokio::spawn(reaper.run(rx.clone())));
        }

        tracing::info!(concurrency, "Worker pool started");
        WorkerHandle { shutdown, tasks }
    }
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for in-flight deliveries to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task terminated abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_executor(
    executor: usize,
    worker: Arc<ScoringWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(executor, "Executor started");
    let poll_interval = worker.config.poll_interval;

    while !*shutdown.borrow() {
        match worker.poll_once().await {
            Ok(Some(outcome)) => tracing::debug!(executor, ?outcome, "Delivery handled"),
            Ok(None) => {
                if !pause(&mut shutdown, poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(executor, error = %e, "Error processing delivery, will retry");
                if !pause(&mut shutdown, poll_interval).await {
                    break;
                }
            }
        }
    }
    tracing::debug!(executor, "Executor stopped");
}

/// Sleep for `period` unless shutdown is signalled first. Returns whether
/// to keep running.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
