//! Pipeline configuration
//!
//! Batch sizing, worker concurrency and the retry policy shared by both queues.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::queue::{Backoff, BackoffKind, JobOptions};

/// Default rows per insertion batch.
pub const DEFAULT_BATCH_SIZE: usize = super::splitter::DEFAULT_BATCH_SIZE;

/// Default concurrent insertion jobs.
pub const DEFAULT_INSERTION_CONCURRENCY: usize = 5;

/// Default concurrent split jobs.
pub const DEFAULT_SPLITTER_CONCURRENCY: usize = 1;

/// Default deliveries per job, including the first.
pub const DEFAULT_JOB_ATTEMPTS: u32 = 3;

/// Default base retry delay in milliseconds.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 1000;

/// Default number of failed jobs kept per queue.
pub const DEFAULT_REMOVE_ON_FAIL: usize = 1000;

/// Default idle poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default heartbeat timeout before an active job is reclaimed.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;

/// Which queue backend to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Postgres,
    Memory,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BrokerKind::Postgres),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(format!("unknown broker: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub insertion_concurrency: usize,
    pub splitter_concurrency: usize,
    pub job_attempts: u32,
    pub backoff_kind: BackoffKind,
    pub backoff_delay_ms: u64,
    pub remove_on_complete: bool,
    pub remove_on_fail: usize,
    pub poll_interval_ms: u64,
    pub stall_timeout_secs: u64,
    pub broker: BrokerKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            insertion_concurrency: DEFAULT_INSERTION_CONCURRENCY,
            splitter_concurrency: DEFAULT_SPLITTER_CONCURRENCY,
            job_attempts: DEFAULT_JOB_ATTEMPTS,
            backoff_kind: BackoffKind::Exponential,
            backoff_delay_ms: DEFAULT_BACKOFF_DELAY_MS,
            remove_on_complete: true,
            remove_on_fail: DEFAULT_REMOVE_ON_FAIL,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            broker: BrokerKind::Postgres,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Read `PIPELINE_*` variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            batch_size: env_or("PIPELINE_BATCH_SIZE", defaults.batch_size),
            insertion_concurrency: env_or(
                "PIPELINE_INSERTION_CONCURRENCY",
                defaults.insertion_concurrency,
            ),
            splitter_concurrency: env_or(
                "PIPELINE_SPLITTER_CONCURRENCY",
                defaults.splitter_concurrency,
            ),
            job_attempts: env_or("PIPELINE_JOB_ATTEMPTS", defaults.job_attempts),
            backoff_kind: env_or("PIPELINE_BACKOFF_KIND", defaults.backoff_kind),
            backoff_delay_ms: env_or("PIPELINE_BACKOFF_DELAY_MS", defaults.backoff_delay_ms),
            remove_on_complete: env_or("PIPELINE_REMOVE_ON_COMPLETE", defaults.remove_on_complete),
            remove_on_fail: env_or("PIPELINE_REMOVE_ON_FAIL", defaults.remove_on_fail),
            poll_interval_ms: env_or("PIPELINE_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            stall_timeout_secs: env_or("PIPELINE_STALL_TIMEOUT_SECS", defaults.stall_timeout_secs),
            broker: env_or("PIPELINE_BROKER", defaults.broker),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Pipeline batch_size must be greater than 0");
        }

        if self.insertion_concurrency == 0 || self.splitter_concurrency == 0 {
            anyhow::bail!("Pipeline worker concurrency must be greater than 0");
        }

        if self.job_attempts == 0 {
            anyhow::bail!("Pipeline job_attempts must be at least 1");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("Pipeline poll_interval_ms must be greater than 0");
        }

        if self.stall_timeout_secs == 0 {
            anyhow::bail!("Pipeline stall_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Options applied to every job on both queues
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.job_attempts,
            backoff: Backoff {
                kind: self.backoff_kind,
                delay: Duration::from_millis(self.backoff_delay_ms),
            },
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}
