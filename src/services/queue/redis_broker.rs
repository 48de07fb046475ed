use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, Script};
use std::time::Duration;
use uuid::Uuid;

use super::{new_lock_token, Broker, BrokerConfig, Delivery, QueueError, QueueStats};
use crate::models::job::ScoringPayload;

// Every script receives the same KEYS, in this order:
//   1 pending   ZSET  job id -> visible-at (ms)
//   2 inflight  ZSET  job id -> lock expiry (ms)
//   3 payload   HASH  job id -> payload json
//   4 attempts  HASH  job id -> deliveries so far
//   5 token     HASH  job id -> current lock token
//   6 enqueued  STRING counter
// Time always comes from the Redis server so executors never compare clocks.

const NOW: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
"#;

const ENQUEUE: &str = r#"
if redis.call('HSETNX', KEYS[3], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('HSET', KEYS[4], ARGV[1], 0)
redis.call('ZADD', KEYS[1], now, ARGV[1])
redis.call('INCR', KEYS[6])
return 1
"#;

const DEQUEUE: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[5], id)
  redis.call('ZADD', KEYS[1], now, id)
end
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
if #ready == 0 then
  return false
end
local id = ready[1]
redis.call('ZREM', KEYS[1], id)
local payload = redis.call('HGET', KEYS[3], id)
if not payload then
  redis.call('HDEL', KEYS[4], id)
  return false
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), id)
local attempt = redis.call('HINCRBY', KEYS[4], id, 1)
redis.call('HSET', KEYS[5], id, ARGV[2])
return {id, payload, attempt}
"#;

const ACK: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
return 1
"#;

const RENEW: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[2], 'XX', now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const RETRY: &str = r#"
if redis.call('HGET', KEYS[5], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const IS_LOCKED: &str = r#"
local expiry = redis.call('ZSCORE', KEYS[2], ARGV[1])
if expiry and tonumber(expiry) > now then
  return 1
end
return 0
"#;

const STATS: &str = r#"
local waiting = redis.call('ZCOUNT', KEYS[1], '-inf', now)
local delayed = redis.call('ZCOUNT', KEYS[1], '(' .. now, '+inf')
local active = redis.call('ZCARD', KEYS[2])
local enqueued = tonumber(redis.call('GET', KEYS[6]) or '0')
return {waiting, delayed, active, enqueued}
"#;

fn script(body: &str) -> Script {
    Script::new(&format!("{NOW}{body}"))
}

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    renew: Script,
    retry: Script,
    is_locked: Script,
    stats: Script,
}

/// Redis-backed broker with keyed, lock-fenced deliveries.
pub struct RedisBroker {
    client: redis::Client,
    keys: [String; 6],
    lock_duration: Duration,
    scripts: Scripts,
}

impl RedisBroker {
    pub fn new(redis_url: &str, config: &BrokerConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let prefix = &config.queue_name;
        let keys = ["pending", "inflight", "payload", "attempts", "token", "enqueued"]
            .map(|suffix| format!("{prefix}:{suffix}"));

        Ok(Self {
            client,
            keys,
            lock_duration: config.lock_duration,
            scripts: Scripts {
                enqueue: script(ENQUEUE),
                dequeue: script(DEQUEUE),
                ack: script(ACK),
                renew: script(RENEW),
                retry: script(RETRY),
                is_locked: script(IS_LOCKED),
                stats: script(STATS),
            },
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn run<T: FromRedisValue>(
        &self,
        script: &Script,
        args: &[String],
    ) -> Result<T, QueueError> {
        let mut conn = self.conn().await?;
        let mut invocation = script.prepare_invoke();
        for key in &self.keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let value = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn fenced(
        &self,
        script: &Script,
        delivery: &Delivery,
        extra: Option<u64>,
    ) -> Result<bool, QueueError> {
        let mut args = vec![delivery.job_id().to_string(), delivery.token.clone()];
        if let Some(ms) = extra {
            args.push(ms.to_string());
        }
        let applied: i64 = self.run(script, &args).await?;
        Ok(applied == 1)
    }

    fn lock_ms(&self) -> u64 {
        self.lock_duration.as_millis() as u64
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, payload: &ScoringPayload) -> Result<bool, QueueError> {
        let body = serde_json::to_string(payload).map_err(QueueError::Serialize)?;
        let created: i64 = self
            .run(&self.scripts.enqueue, &[payload.job_id.to_string(), body])
            .await?;
        Ok(created == 1)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let token = new_lock_token();
        let leased: Option<(String, String, u32)> = self
            .run(
                &self.scripts.dequeue,
                &[self.lock_ms().to_string(), token.clone()],
            )
            .await?;

        let Some((id, body, attempt)) = leased else {
            return Ok(None);
        };

        match serde_json::from_str::<ScoringPayload>(&body) {
            Ok(payload) => Ok(Some(Delivery {
                payload,
                attempt,
                token,
            })),
            Err(e) => {
                // A payload that cannot be decoded will never succeed; drop it.
                tracing::error!(delivery_key = %id, error = %e, "Dropping undecodable delivery");
                let _: i64 = self.run(&self.scripts.ack, &[id.clone(), token]).await?;
                Err(QueueError::Malformed(format!("delivery {id}: {e}")))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        self.fenced(&self.scripts.ack, delivery, None).await
    }

    async fn renew_lock(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        self.fenced(&self.scripts.renew, delivery, Some(self.lock_ms()))
            .await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError> {
        self.fenced(&self.scripts.retry, delivery, Some(delay.as_millis() as u64))
            .await
    }

    async fn is_locked(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let locked: i64 = self
            .run(&self.scripts.is_locked, &[job_id.to_string()])
            .await?;
        Ok(locked == 1)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (waiting, delayed, active, enqueued_total): (u64, u64, u64, u64) =
            self.run(&self.scripts.stats, &[]).await?;
        Ok(QueueStats {
            waiting,
            delayed,
            active,
            enqueued_total,
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
