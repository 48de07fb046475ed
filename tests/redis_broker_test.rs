//! Delivery semantics of the Redis broker.
//!
//! Requires a running Redis reachable through `REDIS_URL` (defaults to
//! `redis://127.0.0.1:6379`). Each test uses a queue name of its own.
//!
//! Run with: cargo test --test redis_broker_test -- --ignored

use std::time::Duration;
use uuid::Uuid;

use submission_scoring::models::job::ScoringPayload;
use submission_scoring::models::submission::SubmissionContent;
use submission_scoring::services::queue::{Broker, BrokerConfig, QueueError, RedisBroker};

fn redis_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn broker(lock_duration: Duration) -> (RedisBroker, String) {
    let queue_name = format!("scoring-test-{}", Uuid::new_v4().simple());
    let broker = RedisBroker::new(
        &redis_url(),
        &BrokerConfig {
            queue_name: queue_name.clone(),
            lock_duration,
        },
    )
    .expect("Failed to initialize queue");
    (broker, queue_name)
}

fn payload() -> ScoringPayload {
    ScoringPayload {
        job_id: Uuid::new_v4(),
        submission_id: Uuid::new_v4(),
        content: SubmissionContent::new("const x = 1;", "docs"),
    }
}

#[tokio::test]
#[ignore]
async fn test_enqueue_is_idempotent_by_key() {
    let (broker, _) = broker(Duration::from_secs(30));
    let p = payload();
    assert!(broker.enqueue(&p).await.unwrap());
    assert!(!broker.enqueue(&p).await.unwrap());

    let delivery = broker.dequeue().await.unwrap().unwrap();
    assert_eq!(delivery.attempt, 1);
    assert!(!broker.enqueue(&p).await.unwrap());
    assert_eq!(broker.stats().await.unwrap().enqueued_total, 1);

    assert!(broker.ack(&delivery).await.unwrap());
    assert!(broker.enqueue(&p).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_expired_lock_redelivers_and_fences_old_owner() {
    let (broker, _) = broker(Duration::from_millis(200));
    broker.enqueue(&payload()).await.unwrap();

    let first = broker.dequeue().await.unwrap().unwrap();
    assert!(broker.is_locked(first.job_id()).await.unwrap());
    assert!(broker.dequeue().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!broker.is_locked(first.job_id()).await.unwrap());

    // The expired delivery goes back to pending and keeps its count.
    let second = broker.dequeue().await.unwrap().unwrap();
    assert_eq!(second.job_id(), first.job_id());
    assert_eq!(second.attempt, 2);

    // Every fenced operation of the first holder is now a no-op.
    assert!(!broker.renew_lock(&first).await.unwrap());
    assert!(!broker
        .retry(&first, Duration::from_millis(10))
        .await
        .unwrap());
    assert!(!broker.ack(&first).await.unwrap());
    assert!(broker.is_locked(second.job_id()).await.unwrap());

    assert!(broker.ack(&second).await.unwrap());
    let stats = broker.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.active), (0, 0, 0));
}

#[tokio::test]
#[ignore]
async fn test_renew_keeps_delivery_hidden() {
    let (broker, _) = broker(Duration::from_millis(300));
    broker.enqueue(&payload()).await.unwrap();
    let delivery = broker.dequeue().await.unwrap().unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(broker.renew_lock(&delivery).await.unwrap());
    }
    assert!(broker.dequeue().await.unwrap().is_none());
    assert!(broker.is_locked(delivery.job_id()).await.unwrap());
    assert!(broker.ack(&delivery).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_retry_delays_visibility() {
    let (broker, _) = broker(Duration::from_secs(30));
    broker.enqueue(&payload()).await.unwrap();
    let delivery = broker.dequeue().await.unwrap().unwrap();

    assert!(broker
        .retry(&delivery, Duration::from_millis(300))
        .await
        .unwrap());
    assert!(!broker.is_locked(delivery.job_id()).await.unwrap());
    let stats = broker.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.active), (0, 1, 0));
    assert!(broker.dequeue().await.unwrap().is_none());

    // The released token no longer acknowledges anything.
    assert!(!broker.ack(&delivery).await.unwrap());

    tokio::time::sleep(Duration::from_millis(450)).await;
    let again = broker.dequeue().await.unwrap().unwrap();
    assert_eq!(again.job_id(), delivery.job_id());
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
#[ignore]
async fn test_undecodable_payload_is_dropped() {
    let (broker, queue_name) = broker(Duration::from_secs(30));
    let id = Uuid::new_v4().to_string();

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::pipe()
        .hset(format!("{queue_name}:payload"), &id, "{not json")
        .hset(format!("{queue_name}:attempts"), &id, 0)
        .zadd(format!("{queue_name}:pending"), &id, 0)
        .query_async::<()>(&mut conn)
        .await
        .unwrap();

    let err = broker.dequeue().await.unwrap_err();
    assert!(matches!(err, QueueError::Malformed(msg) if msg.contains(&id)));

    assert!(broker.dequeue().await.unwrap().is_none());
    let stats = broker.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.active), (0, 0, 0));
}
