// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::local::LocalBackend;
use async_trait::async_trait;
use muster_cloud::{FakeProvider, Flavor, Host, HostConfig, HostRecord, Provider, SshConfig};

struct StubBackend {
    capacity: usize,
    running: Arc<Mutex<usize>>,
    dispatched: Arc<Mutex<Vec<ItemKey>>>,
    cancelled: Arc<Mutex<Vec<ItemKey>>>,
}

impl StubBackend {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            running: Arc::new(Mutex::new(0)),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn can_fit(&self, _req: &Requirements) -> usize {
        self.capacity.saturating_sub(*self.running.lock())
    }

    async fn dispatch(
        &self,
        key: ItemKey,
        _cmd: String,
        _req: Requirements,
    ) -> Result<(), EngineError> {
        *self.running.lock() += 1;
        self.dispatched.lock().push(key);
        Ok(())
    }

    async fn cancel(&self, key: &ItemKey) -> Result<(), EngineError> {
        self.cancelled.lock().push(key.clone());
        Ok(())
    }
}

fn req() -> Requirements {
    Requirements::new(1, 0, 0, Duration::from_secs(60))
}

fn quick_config() -> DriverConfig {
    DriverConfig {
        tick: Duration::from_millis(20),
        max_attempts: 2,
        retry_backoff: Duration::from_millis(30),
    }
}

fn make_driver(backend: StubBackend) -> (Driver<StubBackend>, mpsc::Sender<ControllerMsg>) {
    let (msg_tx, msg_rx) = mpsc::channel(16);
    let driver = Driver::new(Queue::new(), backend, msg_rx, None, quick_config());
    (driver, msg_tx)
}

fn essence(n: u32) -> Essence {
    Essence::new(format!("echo {}", n)).with_cwd("/tmp")
}

#[tokio::test]
async fn submit_enqueues_a_ready_item() {
    let (driver, _tx) = make_driver(StubBackend::new(4));
    let key = driver.submit(&essence(1), &req(), 5, Duration::ZERO, Vec::new()).unwrap();

    let item = driver.queue().get(&key).unwrap();
    assert_eq!(item.state, ItemState::Ready);
    assert_eq!(item.priority, 5);
    assert_eq!(item.data["cmd"], "echo 1");
    driver.queue().destroy();
}

#[tokio::test]
async fn duplicate_submission_is_rejected_while_tracked() {
    let (driver, _tx) = make_driver(StubBackend::new(4));
    driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    let err = driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap_err();
    assert!(matches!(err, EngineError::Queue(QueueError::KeyExists(_))));
    driver.queue().destroy();
}

#[tokio::test]
async fn dispatch_is_bounded_by_backend_capacity() {
    let (driver, _tx) = make_driver(StubBackend::new(2));
    for n in 0..5 {
        driver.submit(&essence(n), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    }

    driver.dispatch_ready().await;

    assert_eq!(driver.backend.dispatched.lock().len(), 2);
    let stats = driver.queue().stats().unwrap();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.ready, 3);
    driver.queue().destroy();
}

#[tokio::test]
async fn successful_completion_removes_the_item() {
    let (mut driver, _tx) = make_driver(StubBackend::new(4));
    let key = driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    driver.dispatch_ready().await;

    driver
        .handle(ControllerMsg::JobDone { key: key.clone(), host: None, outcome: Ok(()) })
        .await;

    assert!(matches!(driver.queue().get(&key), Err(QueueError::NotFound(_))));
    assert_eq!(driver.queue().stats().unwrap().removed, 1);
    driver.queue().destroy();
}

#[tokio::test]
async fn failure_retries_then_buries_when_attempts_run_out() {
    let (mut driver, _tx) = make_driver(StubBackend::new(4));
    let key = driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    driver.dispatch_ready().await;

    let failure = || JobFailure { reason: "exited with 1".to_string(), ssh_unavailable: false };

    // first failure: one attempt spent, so it is re-queued with backoff
    driver
        .handle(ControllerMsg::JobDone { key: key.clone(), host: None, outcome: Err(failure()) })
        .await;
    assert_eq!(driver.queue().get(&key).unwrap().state, ItemState::Delay);

    // wait out the backoff, run it again
    tokio::time::sleep(Duration::from_millis(100)).await;
    *driver.backend.running.lock() = 0;
    driver.dispatch_ready().await;
    assert_eq!(driver.queue().get(&key).unwrap().attempts, 2);

    // second failure exhausts max_attempts = 2
    driver
        .handle(ControllerMsg::JobDone { key: key.clone(), host: None, outcome: Err(failure()) })
        .await;
    assert_eq!(driver.queue().get(&key).unwrap().state, ItemState::Bury);
    driver.queue().destroy();
}

#[tokio::test]
async fn abnormal_pod_termination_counts_as_failure() {
    let (mut driver, _tx) = make_driver(StubBackend::new(4));
    let key = driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    driver.dispatch_ready().await;

    driver
        .handle(ControllerMsg::PodTerminated {
            key: key.clone(),
            normal: false,
            error: Some("ImagePullBackOff".to_string()),
        })
        .await;
    assert_eq!(driver.queue().get(&key).unwrap().state, ItemState::Delay);

    driver
        .handle(ControllerMsg::PodTerminated { key: key.clone(), normal: true, error: None })
        .await;
    // normal termination settles whatever state the item was in
    assert!(driver.queue().get(&key).is_err());
    driver.queue().destroy();
}

fn quarantine_target(provider: Arc<FakeProvider>) -> Arc<Host> {
    Host::new(
        HostConfig {
            record: HostRecord {
                id: "srv-1".to_string(),
                name: "muster-host-1".to_string(),
                ip: "10.0.0.1".to_string(),
                flavor: Flavor::new("f1", "m1.large", 4, 16_384, 100),
                key_ref: "muster-key".to_string(),
                namespace: String::new(),
            },
            user: "ubuntu".to_string(),
            ttd: Duration::ZERO,
            ssh: SshConfig::default(),
        },
        provider,
    )
}

#[tokio::test]
async fn two_consecutive_ssh_failures_quarantine_the_host() {
    let provider = Arc::new(FakeProvider::new());
    let placement = muster_cloud::Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    let host = quarantine_target(provider);
    placement.add_host(Arc::clone(&host));

    let (msg_tx, msg_rx) = mpsc::channel(16);
    drop(msg_tx);
    let mut driver = Driver::new(
        Queue::new(),
        StubBackend::new(4),
        msg_rx,
        Some(placement),
        quick_config(),
    );

    let ssh_failure = || JobFailure { reason: "ssh unavailable".to_string(), ssh_unavailable: true };

    driver
        .handle(ControllerMsg::JobDone {
            key: "k1".into(),
            host: Some("srv-1".to_string()),
            outcome: Err(ssh_failure()),
        })
        .await;
    assert!(!host.is_bad(), "one strike is not enough");

    driver
        .handle(ControllerMsg::JobDone {
            key: "k2".into(),
            host: Some("srv-1".to_string()),
            outcome: Err(ssh_failure()),
        })
        .await;
    assert!(host.is_bad(), "two strikes quarantine");
    driver.queue().destroy();
}

#[tokio::test]
async fn a_success_resets_the_ssh_strike_count() {
    let provider = Arc::new(FakeProvider::new());
    let placement = muster_cloud::Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    let host = quarantine_target(provider);
    placement.add_host(Arc::clone(&host));

    let (msg_tx, msg_rx) = mpsc::channel(16);
    drop(msg_tx);
    let mut driver = Driver::new(
        Queue::new(),
        StubBackend::new(4),
        msg_rx,
        Some(placement),
        quick_config(),
    );

    let ssh_failure = || JobFailure { reason: "ssh unavailable".to_string(), ssh_unavailable: true };

    driver
        .handle(ControllerMsg::JobDone {
            key: "k1".into(),
            host: Some("srv-1".to_string()),
            outcome: Err(ssh_failure()),
        })
        .await;
    driver
        .handle(ControllerMsg::JobDone {
            key: "k2".into(),
            host: Some("srv-1".to_string()),
            outcome: Ok(()),
        })
        .await;
    driver
        .handle(ControllerMsg::JobDone {
            key: "k3".into(),
            host: Some("srv-1".to_string()),
            outcome: Err(ssh_failure()),
        })
        .await;
    assert!(!host.is_bad(), "strikes must be consecutive");
    driver.queue().destroy();
}

#[tokio::test]
async fn host_bad_message_quarantines_directly() {
    let provider = Arc::new(FakeProvider::new());
    let placement = muster_cloud::Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    let host = quarantine_target(provider);
    placement.add_host(Arc::clone(&host));

    let (msg_tx, msg_rx) = mpsc::channel(16);
    drop(msg_tx);
    let mut driver = Driver::new(
        Queue::new(),
        StubBackend::new(4),
        msg_rx,
        Some(placement),
        quick_config(),
    );

    driver.handle(ControllerMsg::HostBad { host_id: "srv-1".to_string() }).await;
    assert!(host.is_bad());
    driver.queue().destroy();
}

#[tokio::test]
async fn kill_signals_only_running_jobs() {
    let (driver, _tx) = make_driver(StubBackend::new(1));
    let running = driver.submit(&essence(1), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    let waiting = driver.submit(&essence(2), &req(), 0, Duration::ZERO, Vec::new()).unwrap();
    driver.dispatch_ready().await;

    let missing: ItemKey = "not-a-job".into();
    let (killed, first_error) = driver
        .kill(&[running.clone(), waiting.clone(), missing])
        .await;

    assert_eq!(killed, 1);
    assert!(first_error.is_some(), "the unknown key surfaces as the first error");
    assert_eq!(driver.backend.cancelled.lock().as_slice(), &[running]);
    driver.queue().destroy();
}

#[tokio::test]
async fn run_loop_executes_a_command_end_to_end() {
    let (msg_tx, msg_rx) = mpsc::channel(16);
    let backend = LocalBackend::with_capacity(msg_tx, 2, 1024);
    let queue = Queue::new();
    let driver = Driver::new(queue.clone(), backend, msg_rx, None, quick_config());

    driver.submit(&Essence::new("true"), &req(), 0, Duration::ZERO, Vec::new()).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(driver.run(shutdown_rx));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match queue.stats() {
            Ok(stats) if stats.removed == 1 && stats.total() == 0 => break,
            Ok(_) => {}
            Err(_) => panic!("queue closed before the command completed"),
        }
        assert!(std::time::Instant::now() < deadline, "command never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
    assert!(matches!(queue.stats(), Err(QueueError::Closed)));
}
