use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{new_lock_token, Broker, BrokerConfig, Delivery, QueueError, QueueStats};
use crate::models::job::ScoringPayload;

#[derive(Debug)]
enum Slot {
    Pending { visible_at: Instant },
    InFlight { token: String, expires_at: Instant },
}

#[derive(Debug)]
struct Entry {
    payload: ScoringPayload,
    attempts: u32,
    slot: Slot,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
    enqueued_total: u64,
}

/// In-process broker with the same keyed, lock-fenced semantics as
/// [`super::RedisBroker`]. Used by tests and single-process setups.
///
/// The lock is only held inside synchronous critical sections.
#[derive(Debug)]
pub struct MemoryBroker {
    lock_duration: Duration,
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            lock_duration: config.lock_duration,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self::new(&BrokerConfig {
            lock_duration,
            ..BrokerConfig::default()
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain data; the map itself is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_owned_entry<F>(&self, delivery: &Delivery, f: F) -> bool
    where
        F: FnOnce(&mut State, Uuid),
    {
        let mut state = self.state();
        let owned = matches!(
            state.entries.get(&delivery.job_id()),
            Some(Entry { slot: Slot::InFlight { token, .. }, .. }) if *token == delivery.token
        );
        if owned {
            f(&mut *state, delivery.job_id());
        }
        owned
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, payload: &ScoringPayload) -> Result<bool, QueueError> {
        let mut state = self.state();
        if state.entries.contains_key(&payload.job_id) {
            return Ok(false);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.enqueued_total += 1;
        state.entries.insert(
            payload.job_id,
            Entry {
                payload: payload.clone(),
                attempts: 0,
                slot: Slot::Pending {
                    visible_at: Instant::now(),
                },
                seq,
            },
        );
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state();

        let next = state
            .entries
            .iter()
            .filter_map(|(id, entry)| match &entry.slot {
                Slot::Pending { visible_at } if *visible_at <= now => {
                    Some((*visible_at, entry.seq, *id))
                }
                Slot::InFlight { expires_at, .. } if *expires_at <= now => {
                    Some((*expires_at, entry.seq, *id))
                }
                _ => None,
            })
            .min()
            .map(|(_, _, id)| id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };

        let token = new_lock_token();
        entry.attempts += 1;
        entry.slot = Slot::InFlight {
            token: token.clone(),
            expires_at: now + self.lock_duration,
        };

        Ok(Some(Delivery {
            payload: entry.payload.clone(),
            attempt: entry.attempts,
            token,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        Ok(self.with_owned_entry(delivery, |state, id| {
            state.entries.remove(&id);
        }))
    }

    async fn renew_lock(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let lock_duration = self.lock_duration;
        Ok(self.with_owned_entry(delivery, |state, id| {
            if let Some(Entry {
                slot: Slot::InFlight { expires_at, .. },
                ..
            }) = state.entries.get_mut(&id)
            {
                *expires_at = Instant::now() + lock_duration;
            }
        }))
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError> {
        Ok(self.with_owned_entry(delivery, |state, id| {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.slot = Slot::Pending {
                    visible_at: Instant::now() + delay,
                };
            }
        }))
    }

    async fn is_locked(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let now = Instant::now();
        Ok(matches!(
            self.state().entries.get(&job_id),
            Some(Entry { slot: Slot::InFlight { expires_at, .. }, .. }) if *expires_at > now
        ))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Instant::now();
        let state = self.state();
        let mut stats = QueueStats {
            enqueued_total: state.enqueued_total,
            ..QueueStats::default()
        };
        for entry in state.entries.values() {
            match &entry.slot {
                Slot::Pending { visible_at } if *visible_at <= now => stats.waiting += 1,
                Slot::Pending { .. } => stats.delayed += 1,
                Slot::InFlight { .. } => stats.active += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::submission::SubmissionContent;

    fn payload() -> ScoringPayload {
        ScoringPayload {
            job_id: Uuid::new_v4(),
            submission_id: Uuid::new_v4(),
            content: SubmissionContent::new("const x = 1;", "docs"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_by_key() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_secs(30));
        let p = payload();
        assert!(broker.enqueue(&p).await.unwrap());
        assert!(!broker.enqueue(&p).await.unwrap());

        // Still a no-op while in flight.
        let delivery = broker.dequeue().await.unwrap().unwrap();
        assert!(!broker.enqueue(&p).await.unwrap());
        assert_eq!(broker.stats().await.unwrap().enqueued_total, 1);

        // After ack the key can be used again.
        assert!(broker.ack(&delivery).await.unwrap());
        assert!(broker.enqueue(&p).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_delivery_is_invisible() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_secs(30));
        broker.enqueue(&payload()).await.unwrap();

        let first = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(broker.dequeue().await.unwrap().is_none());
        assert!(broker.is_locked(first.job_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_redelivers_and_fences_old_owner() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_millis(20));
        broker.enqueue(&payload()).await.unwrap();

        let first = broker.dequeue().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!broker.is_locked(first.job_id()).await.unwrap());

        let second = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(second.job_id(), first.job_id());
        assert_eq!(second.attempt, 2);

        // The first holder no longer owns the delivery.
        assert!(!broker.renew_lock(&first).await.unwrap());
        assert!(!broker.ack(&first).await.unwrap());
        assert!(broker.ack(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_keeps_delivery_hidden() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_millis(60));
        broker.enqueue(&payload()).await.unwrap();
        let delivery = broker.dequeue().await.unwrap().unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(broker.renew_lock(&delivery).await.unwrap());
        }
        assert!(broker.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_delays_visibility() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_secs(30));
        broker.enqueue(&payload()).await.unwrap();
        let delivery = broker.dequeue().await.unwrap().unwrap();

        assert!(broker
            .retry(&delivery, Duration::from_millis(30))
            .await
            .unwrap());
        let stats = broker.stats().await.unwrap();
        assert_eq!((stats.waiting, stats.delayed, stats.active), (0, 1, 0));
        assert!(broker.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let again = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = MemoryBroker::with_lock_duration(Duration::from_secs(30));
        let a = payload();
        let b = payload();
        broker.enqueue(&a).await.unwrap();
        broker.enqueue(&b).await.unwrap();
        assert_eq!(broker.dequeue().await.unwrap().unwrap().job_id(), a.job_id);
        assert_eq!(broker.dequeue().await.unwrap().unwrap().job_id(), b.job_id);
    }
}
