use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use autoreduce_core::{
    AppConfig, AutoreduceError, BrokerClient, FailureKind, JobMessage, LogLocations, Outcome,
    PathTranslator, ReductionExecutor, RunIdentity, RunRecord, RunStateStore, RunStatus,
    StatusMessage,
};
use autoreduce_dispatcher::{Dispatcher, JobValidator, CANCELLED_MESSAGE};
use autoreduce_infrastructure::{InMemoryBroker, InMemoryRunStore};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const PENDING: &str = "ReductionPending";
const STARTED: &str = "ReductionStarted";
const COMPLETE: &str = "ReductionComplete";
const ERROR: &str = "ReductionError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Start,
    End,
}

/// 记录调用顺序的执行器
struct RecordingExecutor {
    delay: Duration,
    failing: HashSet<RunIdentity>,
    events: Mutex<Vec<(RunIdentity, Event, Instant)>>,
}

impl RecordingExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: HashSet::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, identity: RunIdentity) -> Self {
        self.failing.insert(identity);
        self
    }

    fn events(&self) -> Vec<(RunIdentity, Event, Instant)> {
        self.events.lock().unwrap().clone()
    }

    fn calls(&self, identity: &RunIdentity) -> usize {
        self.events()
            .iter()
            .filter(|(id, event, _)| id == identity && *event == Event::Start)
            .count()
    }

    fn at(&self, identity: &RunIdentity, event: Event) -> Instant {
        self.events()
            .iter()
            .find(|(id, e, _)| id == identity && *e == event)
            .map(|(_, _, at)| *at)
            .unwrap()
    }
}

#[async_trait]
impl ReductionExecutor for RecordingExecutor {
    async fn execute(&self, job: &JobMessage) -> Outcome {
        let identity = job.identity();
        self.events
            .lock()
            .unwrap()
            .push((identity.clone(), Event::Start, Instant::now()));
        tokio::time::sleep(self.delay).await;
        self.events
            .lock()
            .unwrap()
            .push((identity.clone(), Event::End, Instant::now()));

        let output_directory = PathBuf::from(format!(
            "/instrument/{}/RB{}/autoreduced/{}",
            job.instrument, job.experiment_id, job.run_number
        ));
        let logs = LogLocations {
            out_log: output_directory.join("reduction_log/out"),
            err_log: output_directory.join("reduction_log/err"),
        };

        if self.failing.contains(&identity) {
            Outcome::Error {
                kind: FailureKind::Script,
                message: "Reduction script failed (exit status: 1): ValueError".to_string(),
                logs: Some(logs),
                output_directory: Some(output_directory),
            }
        } else {
            Outcome::Completed {
                logs,
                output_directory,
            }
        }
    }
}

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryRunStore,
    executor: Arc<RecordingExecutor>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<autoreduce_core::Result<()>>,
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.dispatcher.hold_interval_seconds = 1;
    config.dispatcher.status_publish_retries = 0;
    config.dispatcher.shutdown_drain_seconds = 5;
    config
}

fn job(run_number: u64, experiment_id: Value) -> Value {
    job_on("POLARIS", run_number, experiment_id)
}

fn job_on(instrument: &str, run_number: u64, experiment_id: Value) -> Value {
    json!({
        "run_number": run_number,
        "run_version": 0,
        "experiment_id": experiment_id,
        "instrument": instrument,
        "data_path": format!("/isis/NDX{instrument}/{instrument}{run_number}.nxs"),
        "script_text": "print('reduce')",
        "standard_vars": {}
    })
}

fn cancel(run_number: u64, experiment_id: Value) -> Value {
    json!({
        "run_number": run_number,
        "run_version": 0,
        "experiment_id": experiment_id,
        "cancel": true
    })
}

impl Harness {
    fn start(executor: RecordingExecutor, config: AppConfig) -> Self {
        let broker = InMemoryBroker::new();
        let store = InMemoryRunStore::new();
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(
            &config,
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            executor.clone(),
            JobValidator::new(PathTranslator::default(), 0.1, None),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

        Self {
            broker,
            store,
            executor,
            shutdown_tx,
            handle,
        }
    }

    async fn send(&self, message: Value) {
        self.broker
            .send(PENDING, &serde_json::to_vec(&message).unwrap(), 0)
            .await
            .unwrap();
    }

    async fn wait_for(&self, identity: &RunIdentity, status: RunStatus) -> RunRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(record) = self.store.find_run(identity).await.unwrap() {
                if record.status == status {
                    return record;
                }
            }
            assert!(
                Instant::now() < deadline,
                "{identity} did not reach {status}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_messages(&self, queue: &str, count: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let sent = self.broker.sent_to(queue).await;
            if sent.len() >= count {
                return sent;
            }
            assert!(Instant::now() < deadline, "expected {count} messages on {queue}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn status_messages(&self, queue: &str) -> Vec<StatusMessage> {
        self.broker
            .sent_to(queue)
            .await
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    async fn shutdown(self) -> autoreduce_core::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await.unwrap()
    }
}

#[tokio::test]
async fn test_same_experiment_runs_are_serialized() -> Result<()> {
    let harness = Harness::start(
        RecordingExecutor::new(Duration::from_millis(300)),
        test_config(),
    );
    let first = RunIdentity::new(42_i64, 1, 0);
    let second = RunIdentity::new("42", 2, 0);
    let other = RunIdentity::new(7_i64, 3, 0);

    harness.send(job(1, json!(42))).await;
    harness.send(job(2, json!("42"))).await;
    harness.send(job(3, json!(7))).await;

    harness.wait_for(&first, RunStatus::Completed).await;
    harness.wait_for(&second, RunStatus::Completed).await;
    harness.wait_for(&other, RunStatus::Completed).await;

    let executor = &harness.executor;
    assert!(executor.at(&second, Event::Start) >= executor.at(&first, Event::End));
    // 不同实验不受影响
    assert!(executor.at(&other, Event::Start) < executor.at(&first, Event::End));
    assert_eq!(harness.status_messages(COMPLETE).await.len(), 3);
    assert_eq!(harness.status_messages(STARTED).await.len(), 3);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_job_prevents_execution() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    let identity = RunIdentity::new(42_i64, 5, 0);

    harness.send(cancel(5, json!(42))).await;
    harness.send(job(5, json!(42))).await;

    let record = harness.wait_for(&identity, RunStatus::Error).await;
    assert_eq!(record.message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(record.cancelled);
    assert_eq!(harness.executor.calls(&identity), 0);

    let errors = harness.status_messages(ERROR).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].status, RunStatus::Error);
    assert_eq!(errors[0].message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(harness.status_messages(STARTED).await.is_empty());

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_calibration_run_is_skipped() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    let identity = RunIdentity::new("abc", 8, 0);

    harness.send(job(8, json!("abc"))).await;

    let record = harness.wait_for(&identity, RunStatus::Skipped).await;
    assert!(record
        .message
        .as_deref()
        .unwrap()
        .contains("Calibration file detected"));
    assert_eq!(harness.executor.calls(&identity), 0);

    let errors = harness.wait_for_messages(ERROR, 1).await;
    let skipped: StatusMessage = serde_json::from_slice(&errors[0])?;
    assert_eq!(skipped.status, RunStatus::Skipped);

    // 槽位已释放
    harness.send(job(9, json!("abc"))).await;
    harness
        .wait_for(&RunIdentity::new("abc", 9, 0), RunStatus::Skipped)
        .await;

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_redelivery_republishes_terminal_status() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    let identity = RunIdentity::new(1910232_i64, 12, 0);

    harness.send(job(12, json!(1910232))).await;
    harness.wait_for(&identity, RunStatus::Completed).await;
    harness.wait_for_messages(COMPLETE, 1).await;

    harness.send(job(12, json!(1910232))).await;
    let complete = harness.wait_for_messages(COMPLETE, 2).await;

    assert_eq!(complete.len(), 2);
    assert_eq!(complete[0], complete[1]);
    assert_eq!(harness.executor.calls(&identity), 1);
    assert_eq!(harness.status_messages(STARTED).await.len(), 1);

    let message: StatusMessage = serde_json::from_slice(&complete[0])?;
    assert_eq!(message.status, RunStatus::Completed);
    assert_eq!(message.facility, "ISIS");
    assert_eq!(
        message.reduction_data.as_deref(),
        Some("/instrument/POLARIS/RB1910232/autoreduced/12")
    );

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_processing_overrides_outcome() -> Result<()> {
    let harness = Harness::start(
        RecordingExecutor::new(Duration::from_millis(500)),
        test_config(),
    );
    let identity = RunIdentity::new(42_i64, 20, 0);

    harness.send(job(20, json!(42))).await;
    harness.wait_for(&identity, RunStatus::Processing).await;
    harness.send(cancel(20, json!(42))).await;

    let record = harness.wait_for(&identity, RunStatus::Error).await;
    assert_eq!(record.message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(harness.executor.calls(&identity), 1);
    assert!(harness.status_messages(COMPLETE).await.is_empty());

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_script_failure_is_retried_automatically() -> Result<()> {
    let mut config = test_config();
    config.retry.enabled = true;
    config.retry.delay_seconds = 1;

    let original = RunIdentity::new(42_i64, 30, 0);
    let retry = RunIdentity::new(42_i64, 30, 1);
    let harness = Harness::start(
        RecordingExecutor::new(Duration::ZERO).failing(original.clone()),
        config,
    );

    harness.send(job(30, json!(42))).await;

    let failed = harness.wait_for(&original, RunStatus::Error).await;
    assert!(failed.message.as_deref().unwrap().contains("ValueError"));

    let retried = harness.wait_for(&retry, RunStatus::Completed).await;
    assert_eq!(retried.retry_of.as_ref(), Some(&original));
    assert_eq!(harness.executor.calls(&retry), 1);

    let original_record = harness.store.find_run(&original).await?.unwrap();
    assert_eq!(original_record.retry_run.as_ref(), Some(&retry));

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_clears_pending_retry() -> Result<()> {
    let mut config = test_config();
    config.retry.enabled = true;
    config.retry.delay_seconds = 3600;

    let original = RunIdentity::new(42_i64, 31, 0);
    let retry = RunIdentity::new(42_i64, 31, 1);
    let harness = Harness::start(
        RecordingExecutor::new(Duration::ZERO).failing(original.clone()),
        config,
    );

    harness.send(job(31, json!(42))).await;
    harness.wait_for(&original, RunStatus::Error).await;
    harness.wait_for(&retry, RunStatus::Queued).await;

    harness.send(cancel(31, json!(42))).await;
    let cancelled = harness.wait_for(&retry, RunStatus::Error).await;
    assert_eq!(cancelled.message.as_deref(), Some(CANCELLED_MESSAGE));

    let original_record = harness.store.find_run(&original).await?.unwrap();
    assert!(original_record.cancelled);
    assert!(!original_record.has_pending_retry());
    assert_eq!(harness.executor.calls(&retry), 0);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_same_run_number_in_other_experiment_runs_separately() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    let polaris = RunIdentity::new(42_i64, 12, 0);
    let wish = RunIdentity::new(43_i64, 12, 0);

    harness.send(job(12, json!(42))).await;
    harness.wait_for(&polaris, RunStatus::Completed).await;
    harness.wait_for_messages(COMPLETE, 1).await;

    harness.send(job_on("WISH", 12, json!(43))).await;
    harness.wait_for(&wish, RunStatus::Completed).await;
    harness.wait_for_messages(COMPLETE, 2).await;

    assert_eq!(harness.executor.calls(&polaris), 1);
    assert_eq!(harness.executor.calls(&wish), 1);
    assert_eq!(harness.store.all_runs().await.len(), 2);

    let complete = harness.status_messages(COMPLETE).await;
    let published: Vec<_> = complete
        .iter()
        .map(|m| (m.experiment_id.to_string(), m.instrument.as_str()))
        .collect();
    assert_eq!(
        published,
        vec![("42".to_string(), "POLARIS"), ("43".to_string(), "WISH")]
    );

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_only_applies_to_its_experiment() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    let kept = RunIdentity::new(42_i64, 60, 0);
    let cancelled = RunIdentity::new(43_i64, 60, 0);

    harness.send(cancel(60, json!(43))).await;
    harness.send(job(60, json!(42))).await;
    harness.send(job_on("WISH", 60, json!("43"))).await;

    harness.wait_for(&kept, RunStatus::Completed).await;
    let record = harness.wait_for(&cancelled, RunStatus::Error).await;
    assert_eq!(record.message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(harness.executor.calls(&kept), 1);
    assert_eq!(harness.executor.calls(&cancelled), 0);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_undecodable_message_does_not_stop_loop() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());

    harness.broker.send(PENDING, b"not json", 0).await?;
    harness.send(job(40, json!(42))).await;

    harness
        .wait_for(&RunIdentity::new(42_i64, 40, 0), RunStatus::Completed)
        .await;
    assert_eq!(harness.broker.acked_tags().await.len(), 2);

    harness.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_fatal_broker_error_stops_dispatcher() -> Result<()> {
    let harness = Harness::start(RecordingExecutor::new(Duration::ZERO), test_config());
    harness.send(job(50, json!(42))).await;
    harness
        .wait_for(&RunIdentity::new(42_i64, 50, 0), RunStatus::Completed)
        .await;

    harness.broker.fail_connection("connection reset").await;

    let result = tokio::time::timeout(Duration::from_secs(5), harness.handle).await??;
    assert!(matches!(result, Err(AutoreduceError::Broker(_))));
    Ok(())
}
