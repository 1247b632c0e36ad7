//! Shared fixtures for pipeline integration tests
//!
//! - `RecordingSink`: in-memory [`RecordSink`] that can fail on demand and
//!   tracks overlapping calls
//! - CSV builders and a helper that writes them to a temp directory
//! - a memory-backed pipeline config with short timings

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use bulkflow_server::pipeline::{BrokerKind, PipelineConfig, RecordSink, SinkError, StorageRecord};

pub const HEADER: &str =
    "Index,Customer Id,First Name,Last Name,Company,City,Country,Phone 1,Phone 2,Email,Subscription Date,Website";

/// CSV text with `rows` generated customer rows
pub fn customers_csv(rows: usize) -> String {
    let mut csv = String::with_capacity(rows * 96 + HEADER.len());
    csv.push_str(HEADER);
    csv.push('\n');
    for n in 0..rows {
        csv.push_str(&format!(
            "{n},C{n:06},First{n},Last{n},Company {n},City,Chile,555-{n:04},,user{n}@example.com,2021-03-{day:02},https://example.com/{n}\n",
            day = n % 28 + 1,
        ));
    }
    csv
}

/// Write `contents` to `dir/name` and return the path
pub async fn write_csv(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await.expect("Failed to write fixture CSV");
    path
}

/// Pipeline config on the memory broker with fast polling
pub fn memory_config() -> PipelineConfig {
    PipelineConfig {
        broker: BrokerKind::Memory,
        poll_interval_ms: 10,
        ..PipelineConfig::default()
    }
}

/// Sink that stores batches in memory
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<StorageRecord>>>,
    calls: Mutex<Vec<Instant>>,
    fail_remaining: AtomicU32,
    delay: Option<Duration>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the first `times` calls
    pub fn failing(times: u32) -> Self {
        Self {
            fail_remaining: AtomicU32::new(times),
            ..Self::default()
        }
    }

    /// Hold each call for `delay`
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.batches.lock().await.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        sizes
    }

    pub async fn total_records(&self) -> usize {
        self.batches.lock().await.iter().map(Vec::len).sum()
    }

    pub async fn records(&self) -> Vec<StorageRecord> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }

    /// Start time of every call, successful or not
    pub async fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().await.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn insert_batch(&self, records: &[StorageRecord]) -> Result<u64, SinkError> {
        self.calls.lock().await.push(Instant::now());

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if fail {
            Err(SinkError::Rejected("connection reset".to_string()))
        } else {
            self.batches.lock().await.push(records.to_vec());
            Ok(records.len() as u64)
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Poll `check` until it returns true or `limit` elapses
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
