//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `CADENCE_DATABASE_URL`: PostgreSQL connection string (required)
//! - `CADENCE_POLL_INTERVAL_SECS`: Scheduler poll interval (default: 60)
//! - `CADENCE_POLL_BATCH_SIZE`: Due actions to claim per poll (default: 500)
//! - `CADENCE_RECLAIM_INTERVAL_SECS`: Stuck-action sweep interval (default: 600)
//! - `CADENCE_RECLAIM_STALE_SECS`: Age at which a processing action is stuck (default: 1800)
//! - `CADENCE_RECLAIM_BATCH_SIZE`: Max actions reclaimed per sweep (default: 100)
//! - `CADENCE_WORKER_CONCURRENCY`: Concurrent jobs per tenant worker (default: 2)
//! - `CADENCE_WORKER_JOBS_PER_MINUTE`: Per-tenant delivery rate cap (default: 100)
//! - `CADENCE_WORKER_POLL_INTERVAL_MS`: Worker queue poll interval (default: 1000)
//! - `CADENCE_WORKER_IDLE_SECS`: Evict a worker idle this long (default: 900)
//! - `CADENCE_JOB_MAX_ATTEMPTS`: Delivery attempts per job (default: 3)
//! - `CADENCE_JOB_BACKOFF_BASE_MS`: Base retry delay, doubled per attempt (default: 5000)
//! - `CADENCE_QUEUE_KEEP_FINISHED`: Finished job rows retained per tenant (default: 500)
//! - `CADENCE_HOUSEKEEPING_INTERVAL_SECS`: Queue trim / idle eviction interval (default: 300)
//! - `CADENCE_SMTP_HOST`: SMTP relay host (optional; log-only delivery when unset)
//! - `CADENCE_SMTP_USERNAME` / `CADENCE_SMTP_PASSWORD`: SMTP credentials (optional)

use std::{env, sync::OnceLock, time::Duration};

use anyhow::{Context, Result};

/// Global configuration cache
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Scheduler poll interval in seconds
    pub poll_interval_secs: u64,

    /// Due actions to claim per poll cycle
    pub poll_batch_size: i64,

    /// Stuck-action sweep interval in seconds
    pub reclaim_interval_secs: u64,

    /// Age in seconds at which a processing action counts as stuck
    pub reclaim_stale_secs: i64,

    /// Maximum actions reclaimed per sweep cycle
    pub reclaim_batch_size: i64,

    /// Concurrent jobs per tenant worker
    pub worker_concurrency: usize,

    /// Per-tenant delivery rate cap (jobs per minute)
    pub worker_jobs_per_minute: u32,

    /// Worker queue poll interval in milliseconds
    pub worker_poll_interval_ms: u64,

    /// Idle threshold in seconds before a tenant worker is evicted
    pub worker_idle_secs: u64,

    /// Delivery attempts per queue job
    pub job_max_attempts: i32,

    /// Base retry delay in milliseconds, doubled per attempt
    pub job_backoff_base_ms: i32,

    /// Finished job rows retained per tenant queue
    pub queue_keep_finished: i64,

    /// Queue trim and idle-worker eviction interval in seconds
    pub housekeeping_interval_secs: u64,

    /// SMTP delivery configuration
    pub smtp: SmtpConfig,
}

/// SMTP relay configuration.
///
/// When `host` is unset the engine falls back to log-only delivery, which
/// is the right mode for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    fn from_env() -> Self {
        Self {
            host: env::var("CADENCE_SMTP_HOST").ok(),
            username: env::var("CADENCE_SMTP_USERNAME").ok(),
            password: env::var("CADENCE_SMTP_PASSWORD").ok(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let database_url = env::var("CADENCE_DATABASE_URL")
            .context("CADENCE_DATABASE_URL environment variable is required")?;

        let poll_interval_secs = env_parse("CADENCE_POLL_INTERVAL_SECS", 60);
        let poll_batch_size = env_parse("CADENCE_POLL_BATCH_SIZE", 500);
        let reclaim_interval_secs = env_parse("CADENCE_RECLAIM_INTERVAL_SECS", 600);
        let reclaim_stale_secs = env_parse("CADENCE_RECLAIM_STALE_SECS", 1800);
        let reclaim_batch_size = env_parse("CADENCE_RECLAIM_BATCH_SIZE", 100);
        let worker_concurrency = env_parse("CADENCE_WORKER_CONCURRENCY", 2);
        let worker_jobs_per_minute = env_parse("CADENCE_WORKER_JOBS_PER_MINUTE", 100);
        let worker_poll_interval_ms = env_parse("CADENCE_WORKER_POLL_INTERVAL_MS", 1000);
        let worker_idle_secs = env_parse("CADENCE_WORKER_IDLE_SECS", 900);
        let job_max_attempts = env_parse("CADENCE_JOB_MAX_ATTEMPTS", 3);
        let job_backoff_base_ms = env_parse("CADENCE_JOB_BACKOFF_BASE_MS", 5000);
        let queue_keep_finished = env_parse("CADENCE_QUEUE_KEEP_FINISHED", 500);
        let housekeeping_interval_secs = env_parse("CADENCE_HOUSEKEEPING_INTERVAL_SECS", 300);

        Ok(Self {
            database_url,
            poll_interval_secs,
            poll_batch_size,
            reclaim_interval_secs,
            reclaim_stale_secs,
            reclaim_batch_size,
            worker_concurrency,
            worker_jobs_per_minute,
            worker_poll_interval_ms,
            worker_idle_secs,
            job_max_attempts,
            job_backoff_base_ms,
            queue_keep_finished,
            housekeeping_interval_secs,
            smtp: SmtpConfig::from_env(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn worker_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    /// Create a test configuration with fast intervals
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            poll_interval_secs: 1,
            poll_batch_size: 50,
            reclaim_interval_secs: 1,
            reclaim_stale_secs: 1800,
            reclaim_batch_size: 100,
            worker_concurrency: 2,
            worker_jobs_per_minute: 100,
            worker_poll_interval_ms: 20,
            worker_idle_secs: 900,
            job_max_attempts: 3,
            job_backoff_base_ms: 5000,
            queue_keep_finished: 500,
            housekeeping_interval_secs: 300,
            smtp: SmtpConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Get the global configuration, loading from environment on first call
/// and returning the cached value afterwards.
pub fn try_get_config() -> Result<Config> {
    match CONFIG.get() {
        Some(config) => Ok(config.clone()),
        None => {
            let config = Config::from_env()?;
            Ok(CONFIG.get_or_init(|| config).clone())
        }
    }
}
