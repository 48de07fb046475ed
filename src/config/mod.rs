use garde::Validate;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::db::PoolConfig;
use crate::services::queue::BrokerConfig;
use crate::services::reaper::ReaperConfig;
use crate::services::scorer::RubricWeights;
use crate::services::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    #[garde(range(min = 1, max = 1000))]
    pub database_max_connections: u32,

    #[serde(default = "default_database_min_connections")]
    #[garde(skip)]
    pub database_min_connections: u32,

    #[serde(default = "default_database_acquire_timeout_ms")]
    #[garde(range(min = 1))]
    pub database_acquire_timeout_ms: u64,

    /// Redis connection string for the scoring queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Redis key prefix of the queue
    #[serde(default = "default_queue_name")]
    #[garde(length(min = 1))]
    pub queue_name: String,

    /// Claims per job before it is marked ERROR
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 100))]
    pub queue_max_attempts: u32,

    /// Base of the exponential retry backoff
    #[serde(default = "default_backoff_delay_ms")]
    #[garde(range(min = 1))]
    pub queue_backoff_delay_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    #[garde(range(min = 1))]
    pub queue_backoff_max_ms: u64,

    /// Concurrent executors per worker process
    #[serde(default = "default_concurrency")]
    #[garde(range(min = 1, max = 256))]
    pub worker_concurrency: usize,

    /// Visibility lock taken on each delivery
    #[serde(default = "default_lock_duration_ms")]
    #[garde(range(min = 100))]
    pub lock_duration_ms: u64,

    /// How often an executor extends the lock while scoring
    #[serde(default = "default_lock_renew_interval_ms")]
    #[garde(range(min = 10))]
    pub lock_renew_interval_ms: u64,

    /// Sleep between dequeue attempts on an empty queue
    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Period of the stale-job reaper; 0 disables it
    #[serde(default = "default_reaper_interval_ms")]
    #[garde(skip)]
    pub reaper_interval_ms: u64,

    /// Age after which an unlocked RUNNING job is considered orphaned
    #[serde(default = "default_stale_job_after_ms")]
    #[garde(range(min = 1))]
    pub stale_job_after_ms: u64,

    /// Prometheus scrape address of the worker process; empty disables it
    #[serde(default = "default_worker_metrics_addr")]
    #[garde(skip)]
    pub worker_metrics_addr: String,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_buffer")]
    #[garde(range(min = 1))]
    pub event_buffer: usize,

    #[serde(default = "default_weight_code_quality")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub scoring_rubric_code_quality: f64,

    #[serde(default = "default_weight_correctness")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub scoring_rubric_correctness: f64,

    #[serde(default = "default_weight_documentation")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub scoring_rubric_documentation: f64,

    #[serde(default = "default_weight_performance")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub scoring_rubric_performance: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    20
}

fn default_database_min_connections() -> u32 {
    5
}

fn default_database_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_name() -> String {
    "scoring-queue".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_concurrency() -> usize {
    5
}

fn default_lock_duration_ms() -> u64 {
    30_000
}

fn default_lock_renew_interval_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_reaper_interval_ms() -> u64 {
    60_000
}

fn default_stale_job_after_ms() -> u64 {
    120_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_weight_code_quality() -> f64 {
    0.3
}

fn default_weight_correctness() -> f64 {
    0.4
}

fn default_weight_documentation() -> f64 {
    0.2
}

fn default_weight_performance() -> f64 {
    0.1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Field ranges plus the constraints that span several fields.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        if self.lock_renew_interval_ms >= self.lock_duration_ms {
            return Err(ConfigError::Invalid(format!(
                "lock_renew_interval_ms ({}) must be shorter than lock_duration_ms ({})",
                self.lock_renew_interval_ms, self.lock_duration_ms
            )));
        }
        if self.queue_backoff_max_ms < self.queue_backoff_delay_ms {
            return Err(ConfigError::Invalid(
                "queue_backoff_max_ms must be at least queue_backoff_delay_ms".to_string(),
            ));
        }
        if self.database_min_connections > self.database_max_connections {
            return Err(ConfigError::Invalid(format!(
                "database_min_connections ({}) exceeds database_max_connections ({})",
                self.database_min_connections, self.database_max_connections
            )));
        }
        if !self.worker_metrics_addr.is_empty()
            && self.worker_metrics_addr.parse::<SocketAddr>().is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "worker_metrics_addr '{}' is not a socket address",
                self.worker_metrics_addr
            )));
        }
        if self.rubric_weights().total() <= 0.0 {
            return Err(ConfigError::Invalid(
                "at least one rubric weight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.database_max_connections,
            min_connections: self.database_min_connections,
            acquire_timeout: Duration::from_millis(self.database_acquire_timeout_ms),
        }
    }

    /// `None` when the worker exporter is disabled.
    pub fn worker_metrics_addr(&self) -> Option<SocketAddr> {
        self.worker_metrics_addr.parse().ok()
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            queue_name: self.queue_name.clone(),
            lock_duration: Duration::from_millis(self.lock_duration_ms),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            max_attempts: self.queue_max_attempts,
            backoff_base: Duration::from_millis(self.queue_backoff_delay_ms),
            backoff_max: Duration::from_millis(self.queue_backoff_max_ms),
            lock_renew_interval: Duration::from_millis(self.lock_renew_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// `None` when the reaper is disabled.
    pub fn reaper(&self) -> Option<ReaperConfig> {
        (self.reaper_interval_ms > 0).then(|| ReaperConfig {
            interval: Duration::from_millis(self.reaper_interval_ms),
            stale_after: Duration::from_millis(self.stale_job_after_ms),
        })
    }

    pub fn rubric_weights(&self) -> RubricWeights {
        RubricWeights {
            code_quality: self.scoring_rubric_code_quality,
            correctness: self.scoring_rubric_correctness,
            documentation: self.scoring_rubric_documentation,
            performance: self.scoring_rubric_performance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> Vec<(String, String)> {
        vec![
            ("DATABASE_URL".into(), "postgres://localhost/scoring".into()),
            ("REDIS_URL".into(), "redis://localhost:6379".into()),
        ]
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = envy::from_iter(base_env()).unwrap();
        config.check().unwrap();
        assert_eq!(config.queue_name, "scoring-queue");
        assert_eq!(config.queue_max_attempts, 3);
        assert_eq!(config.worker().concurrency, 5);
        assert_eq!(config.broker().lock_duration, Duration::from_secs(30));
        assert_eq!(config.rubric_weights().correctness, 0.4);
        assert!(config.reaper().is_some());
        assert_eq!(config.pool().max_connections, 20);
        assert_eq!(
            config.worker_metrics_addr(),
            Some("0.0.0.0:9100".parse().unwrap())
        );
    }

    #[test]
    fn test_overrides() {
        let mut env = base_env();
        env.push(("QUEUE_NAME".into(), "scores".into()));
        env.push(("QUEUE_MAX_ATTEMPTS".into(), "5".into()));
        env.push(("REAPER_INTERVAL_MS".into(), "0".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        config.check().unwrap();
        assert_eq!(config.broker().queue_name, "scores");
        assert_eq!(config.worker().max_attempts, 5);
        assert!(config.reaper().is_none());
    }

    #[test]
    fn test_renewal_must_be_shorter_than_lock() {
        let mut env = base_env();
        env.push(("LOCK_DURATION_MS".into(), "1000".into()));
        env.push(("LOCK_RENEW_INTERVAL_MS".into(), "1000".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pool_and_exporter_settings() {
        let mut env = base_env();
        env.push(("DATABASE_MAX_CONNECTIONS".into(), "6".into()));
        env.push(("DATABASE_MIN_CONNECTIONS".into(), "2".into()));
        env.push(("WORKER_METRICS_ADDR".into(), "".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        config.check().unwrap();
        assert_eq!(config.pool().max_connections, 6);
        assert_eq!(config.pool().min_connections, 2);
        assert!(config.worker_metrics_addr().is_none());

        let mut env = base_env();
        env.push(("DATABASE_MAX_CONNECTIONS".into(), "2".into()));
        env.push(("DATABASE_MIN_CONNECTIONS".into(), "5".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        let mut env = base_env();
        env.push(("WORKER_METRICS_ADDR".into(), "not-an-addr".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut env = base_env();
        env.push(("QUEUE_MAX_ATTEMPTS".into(), "0".into()));
        let config: AppConfig = envy::from_iter(env).unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_missing_database_url() {
        let env = vec![("REDIS_URL".to_string(), "redis://x".to_string())];
        assert!(envy::from_iter::<_, AppConfig>(env).is_err());
    }
}
