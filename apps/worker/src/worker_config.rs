use std::env;
use std::time::Duration;

use fleetward_application::{CoordinatorConfig, MonitorConfig, WorkerPoolConfig};
use fleetward_core::{AppError, AppResult};

/// Process settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub handler_url: String,
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    pub lease_seconds: i64,
    pub renew_interval_seconds: u64,
    pub max_dequeues: u32,
    pub coordinator_tick_seconds: u64,
    pub bucket_count: usize,
    pub monitor_interval_seconds: u64,
    pub change_feed_interval_seconds: u64,
    pub delete_grace_seconds: u64,
    pub tombstone_retention_seconds: u64,
}

impl WorkerConfig {
    /// Reads settings from process environment variables.
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        let handler_url = lookup("WORKER_HANDLER_URL")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Validation("WORKER_HANDLER_URL is required".to_owned()))?;

        let config = Self {
            database_url,
            handler_url,
            max_concurrency: parse_or(&lookup, "WORKER_MAX_CONCURRENCY", 100)?,
            poll_interval_ms: parse_or(&lookup, "WORKER_POLL_INTERVAL_MS", 1000)?,
            lease_seconds: parse_or(&lookup, "WORKER_LEASE_SECONDS", 60)?,
            renew_interval_seconds: parse_or(&lookup, "WORKER_RENEW_INTERVAL_SECONDS", 10)?,
            max_dequeues: parse_or(&lookup, "WORKER_MAX_DEQUEUES", 5)?,
            coordinator_tick_seconds: parse_or(&lookup, "COORDINATOR_TICK_SECONDS", 10)?,
            bucket_count: parse_or(&lookup, "COORDINATOR_BUCKET_COUNT", 256)?,
            monitor_interval_seconds: parse_or(&lookup, "MONITOR_INTERVAL_SECONDS", 60)?,
            change_feed_interval_seconds: parse_or(&lookup, "CHANGE_FEED_INTERVAL_SECONDS", 10)?,
            delete_grace_seconds: parse_or(&lookup, "DELETE_GRACE_SECONDS", 0)?,
            tombstone_retention_seconds: parse_or(&lookup, "TOMBSTONE_RETENTION_SECONDS", 3600)?,
        };

        if config.max_concurrency == 0 {
            return Err(AppError::Validation(
                "WORKER_MAX_CONCURRENCY must be greater than zero".to_owned(),
            ));
        }

        config.pool_config().validate()?;
        config.coordinator_config().validate()?;
        config.monitor_config().validate()?;

        Ok(config)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            renew_interval: Duration::from_secs(self.renew_interval_seconds),
            lease_seconds: self.lease_seconds,
            max_dequeues: self.max_dequeues,
            delete_grace: Duration::from_secs(self.delete_grace_seconds),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tick_interval: Duration::from_secs(self.coordinator_tick_seconds),
            bucket_count: self.bucket_count,
            change_feed_interval: Duration::from_secs(self.change_feed_interval_seconds),
            tombstone_retention: Duration::from_secs(self.tombstone_retention_seconds),
            ..CoordinatorConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let interval = Duration::from_secs(self.monitor_interval_seconds);
        MonitorConfig {
            interval,
            check_timeout: interval.saturating_mul(5) / 6,
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> AppResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse::<T>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}
