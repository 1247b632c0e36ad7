//! End-to-end pipeline tests on the in-memory broker
//!
//! These tests verify:
//! - Files are split into fixed-size batches with one terminal batch
//! - Every row reaches the sink and exactly one completion is reported
//! - Failed batches are retried with exponential backoff
//! - A failed split leaves the source file in place
//! - Insertion concurrency is bounded

use std::sync::Arc;
use std::time::Duration;

use bulkflow_server::pipeline::jobs::{INSERTION_QUEUE, INSERT_JOB_NAME, SPLITTER_QUEUE};
use bulkflow_server::pipeline::queue::{Broker, JobOptions, QueueEvent};
use bulkflow_server::pipeline::{
    BatchInserter, BatchMetadata, InsertJob, PipelineConfig, PipelineCoordinator, SourceRow,
};
use chrono::Utc;

mod helpers;

use helpers::{customers_csv, eventually, memory_config, write_csv, RecordingSink};

const WAIT: Duration = Duration::from_secs(10);

fn start(sink: Arc<RecordingSink>, config: &PipelineConfig) -> PipelineCoordinator {
    let broker = Broker::in_memory().with_poll_interval(config.poll_interval());
    PipelineCoordinator::start(broker, sink, config)
}

async fn insertion_idle(pipeline: &PipelineCoordinator) -> bool {
    let counts = pipeline.queue_counts().await.unwrap();
    counts.insertion.waiting == 0 && counts.insertion.active == 0
}

#[tokio::test]
async fn test_file_is_split_into_batches_and_completed_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "upload.csv", &customers_csv(2500)).await;

    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &memory_config());
    let mut completions = pipeline.completions();

    pipeline.enqueue_file(&path, "customers-2500.csv").await.unwrap();

    let completion = tokio::time::timeout(WAIT, completions.recv())
        .await
        .expect("no completion reported")
        .unwrap();
    assert_eq!(completion.original_file_name, "customers-2500.csv");

    let (sink_ref, pipeline_ref) = (&sink, &pipeline);
    assert!(
        eventually(WAIT, || async move {
            sink_ref.total_records().await == 2500 && insertion_idle(pipeline_ref).await
        })
        .await
    );
    assert_eq!(sink.batch_sizes().await, vec![500, 1000, 1000]);
    assert!(!path.exists(), "source file should be removed after splitting");

    let counts = pipeline.queue_counts().await.unwrap();
    assert_eq!(counts.splitter.completed, 1);
    assert_eq!(counts.insertion.completed, 3);
    assert!(completions.try_recv().is_err(), "only one completion per file");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_exact_multiple_of_batch_size_adds_empty_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "upload.csv", &customers_csv(2000)).await;

    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &memory_config());
    let mut completions = pipeline.completions();

    pipeline.enqueue_file(&path, "customers-2000.csv").await.unwrap();
    tokio::time::timeout(WAIT, completions.recv()).await.unwrap().unwrap();

    let pipeline_ref = &pipeline;
    assert!(eventually(WAIT, || async move { insertion_idle(pipeline_ref).await }).await);
    assert_eq!(sink.batch_sizes().await, vec![1000, 1000]);
    assert_eq!(pipeline.queue_counts().await.unwrap().insertion.completed, 3);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_header_only_file_completes_without_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "upload.csv", &customers_csv(0)).await;

    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &memory_config());
    let mut completions = pipeline.completions();

    pipeline.enqueue_file(&path, "empty.csv").await.unwrap();

    let completion = tokio::time::timeout(WAIT, completions.recv()).await.unwrap().unwrap();
    assert_eq!(completion.original_file_name, "empty.csv");
    assert!(sink.call_times().await.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_rows_are_transformed_before_insert() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "upload.csv", &customers_csv(1)).await;

    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &memory_config());
    let mut completions = pipeline.completions();

    pipeline.enqueue_file(&path, "one.csv").await.unwrap();
    tokio::time::timeout(WAIT, completions.recv()).await.unwrap().unwrap();

    let records = sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].first_name.as_deref(), Some("First0"));
    assert_eq!(records[0].email.as_deref(), Some("user0@example.com"));
    assert_eq!(records[0].phone_2.as_deref(), Some(""));
    assert_eq!(records[0].subscription_date.as_deref(), Some("2021-03-01"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_missing_file_fails_after_all_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        backoff_delay_ms: 5,
        ..memory_config()
    };

    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &config);
    let mut events = pipeline.events();

    let job_id = pipeline
        .enqueue_file(dir.path().join("never-written.csv"), "ghost.csv")
        .await
        .unwrap();

    let failed = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                event @ QueueEvent::Failed { .. } => break event,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();

    match failed {
        QueueEvent::Failed { queue, job_id: id, attempts, .. } => {
            assert_eq!(queue, SPLITTER_QUEUE);
            assert_eq!(id, job_id);
            assert_eq!(attempts, 3);
        },
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(pipeline.queue_counts().await.unwrap().splitter.failed, 1);
    assert!(sink.call_times().await.is_empty());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_failed_split_keeps_source_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut contents = customers_csv(1200);
    contents.push_str("truncated,row\n");
    let path = write_csv(dir.path(), "upload.csv", &contents).await;

    let config = PipelineConfig {
        backoff_delay_ms: 5,
        ..memory_config()
    };
    let sink = Arc::new(RecordingSink::new());
    let pipeline = start(sink.clone(), &config);
    let mut events = pipeline.events();
    let mut completions = pipeline.completions();

    pipeline.enqueue_file(&path, "broken.csv").await.unwrap();

    let attempts = tokio::time::timeout(WAIT, async {
        loop {
            if let QueueEvent::Failed { queue, attempts, .. } = events.recv().await.unwrap() {
                if queue == SPLITTER_QUEUE {
                    break attempts;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(attempts, 3);
    assert!(path.exists(), "source file should be kept when splitting fails");

    // Each attempt got one full batch out before hitting the bad row
    let (sink_ref, pipeline_ref) = (&sink, &pipeline);
    assert!(
        eventually(WAIT, || async move {
            sink_ref.total_records().await == 3000 && insertion_idle(pipeline_ref).await
        })
        .await
    );
    assert_eq!(sink.batch_sizes().await, vec![1000, 1000, 1000]);
    assert!(completions.try_recv().is_err(), "no terminal batch for a failed split");

    pipeline.shutdown().await;
}

fn insert_job(rows: usize, is_terminal: bool) -> InsertJob {
    let metadata = BatchMetadata {
        original_file_name: "retry.csv".to_string(),
        start_timestamp: Utc::now(),
    };
    let rows = (0..rows)
        .map(|n| [("First Name", format!("R{n}"))].into_iter().collect::<SourceRow>())
        .collect();
    InsertJob::new(rows, &metadata, is_terminal)
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_retried_with_exponential_backoff() {
    let broker = Broker::in_memory();
    let queue = broker.queue::<InsertJob>(INSERTION_QUEUE, JobOptions::default());
    let sink = Arc::new(RecordingSink::failing(2));
    let inserter = Arc::new(BatchInserter::new(sink.clone()));
    let mut completions = inserter.subscribe();

    let worker = queue.process(inserter, 5);
    queue.add(INSERT_JOB_NAME, &insert_job(10, true)).await.unwrap();

    let completion = tokio::time::timeout(Duration::from_secs(60), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.original_file_name, "retry.csv");

    let calls = sink.call_times().await;
    assert_eq!(calls.len(), 3);
    assert!(calls[1] - calls[0] >= Duration::from_millis(1000));
    assert!(calls[2] - calls[1] >= Duration::from_millis(2000));
    assert_eq!(sink.total_records().await, 10);
    assert!(completions.try_recv().is_err());

    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_insertion_concurrency_is_bounded() {
    let broker = Broker::in_memory();
    let queue = broker.queue::<InsertJob>(INSERTION_QUEUE, JobOptions::default());
    let sink = Arc::new(RecordingSink::slow(Duration::from_millis(100)));
    let inserter = Arc::new(BatchInserter::new(sink.clone()));
    let mut events = broker.subscribe();

    for n in 0..20 {
        queue.add(INSERT_JOB_NAME, &insert_job(3, n == 19)).await.unwrap();
    }
    let worker = queue.process(inserter, 5);

    for _ in 0..20 {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, QueueEvent::Completed { .. }));
    }

    assert_eq!(sink.peak_concurrency(), 5);
    assert_eq!(sink.total_records().await, 60);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_malformed_insert_payload_fails_immediately() {
    let broker = Broker::in_memory();
    let queue = broker.queue::<InsertJob>(INSERTION_QUEUE, JobOptions::default());
    let sink = Arc::new(RecordingSink::new());
    let mut events = broker.subscribe();

    let worker = queue.process(Arc::new(BatchInserter::new(sink.clone())), 5);
    broker
        .submit(
            INSERTION_QUEUE,
            INSERT_JOB_NAME,
            serde_json::json!({ "rows": "not-a-list" }),
            &JobOptions::default(),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, QueueEvent::Failed { attempts: 1, .. }));
    assert!(sink.call_times().await.is_empty());

    worker.shutdown().await;
}
