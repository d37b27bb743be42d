use std::time::Duration;

use serde::Deserialize;

use crate::services::queue::RetryPolicy;
use crate::services::supervisor::RestartPolicy;
use crate::services::worker_pool::WorkerPoolConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address (health, worker control, metrics)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Key prefix for every queue structure in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Verification provider base URL
    pub verifier_url: String,

    /// Verification provider API key
    pub verifier_api_key: String,

    /// Whether the provider exposes the bulk endpoint
    #[serde(default = "default_true")]
    pub verifier_bulk: bool,

    #[serde(default = "default_verifier_timeout_secs")]
    pub verifier_timeout_secs: u64,

    #[serde(default = "default_scrape_user_agent")]
    pub scrape_user_agent: String,

    #[serde(default = "default_scrape_timeout_secs")]
    pub scrape_timeout_secs: u64,

    // Worker pool
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_worker_rate_per_second")]
    pub worker_rate_per_second: u32,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stalled_check_secs")]
    pub stalled_check_secs: u64,

    #[serde(default = "default_max_stalled")]
    pub max_stalled: u32,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    // Queue retry policy
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long finished queue entries are kept
    #[serde(default = "default_queue_retention_secs")]
    pub queue_retention_secs: u64,

    // Restart supervisor
    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,

    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,

    // Courtesy delays between network batches
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,

    #[serde(default = "default_scrape_delay_ms")]
    pub scrape_delay_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_queue_prefix() -> String {
    "bulkmail:jobs".to_string()
}

fn default_true() -> bool {
    true
}

fn default_verifier_timeout_secs() -> u64 {
    30
}

fn default_scrape_user_agent() -> String {
    format!("bulk-mail-jobs/{}", env!("CARGO_PKG_VERSION"))
}

fn default_scrape_timeout_secs() -> u64 {
    15
}

fn default_worker_concurrency() -> usize {
    3
}

fn default_worker_rate_per_second() -> u32 {
    10
}

fn default_lease_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stalled_check_secs() -> u64 {
    30
}

fn default_max_stalled() -> u32 {
    1
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_queue_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_restart_attempts() -> u32 {
    5
}

fn default_restart_delay_secs() -> u64 {
    5
}

fn default_verify_delay_ms() -> u64 {
    1000
}

fn default_scrape_delay_ms() -> u64 {
    2000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            rate_per_second: self.worker_rate_per_second,
            lease: Duration::from_secs(self.lease_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stalled_interval: Duration::from_secs(self.stalled_check_secs),
            max_stalled: self.max_stalled,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_attempts: self.restart_attempts,
            delay: Duration::from_secs(self.restart_delay_secs),
        }
    }

    pub fn queue_retention(&self) -> Duration {
        Duration::from_secs(self.queue_retention_secs)
    }
}
