use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use drover_core::{
    DroverConfig, Execute, Payload, PoolConfig, TaskId, TaskOutput, TaskStatus, TimingConfig,
    XmlFilter, XslFilter,
};
use drover_rpc::{Connector, RpcError, Transport, WorkerClient};
use tokio::sync::{mpsc, oneshot};

use super::{Controller, ControllerState};
use crate::error::SchedulerError;
use crate::pool::{SpawnedWorker, Spawner, WorkerExit, WorkerStatus};

const BASE_PORT: u16 = 9100;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Run { task: TaskId, port: u16 },
    Status(u16),
    Terminate(u16),
}

type CallLog = Arc<Mutex<Vec<Call>>>;

/// Lets a fake worker "exit on its own" with a code.
type ExitSwitches = Arc<Mutex<HashMap<u16, oneshot::Sender<i32>>>>;

#[derive(Default)]
struct FakeSpawner {
    switches: ExitSwitches,
    fail_port: Option<u16>,
    crash: Option<(u16, Duration, i32)>,
    spawned: Mutex<Vec<u16>>,
}

impl Spawner for FakeSpawner {
    fn spawn(
        &self,
        transport: &Transport,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> std::io::Result<SpawnedWorker> {
        let port = transport.port;
        if self.fail_port == Some(port) {
            return Err(std::io::Error::other("permission denied"));
        }
        self.spawned.lock().unwrap().push(port);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        self.switches.lock().unwrap().insert(port, exit_tx);
        let crash = self
            .crash
            .filter(|(p, _, _)| *p == port)
            .map(|(_, after, code)| (after, code));

        let monitor = tokio::spawn(async move {
            let crashed = async move {
                match crash {
                    Some((after, code)) => {
                        tokio::time::sleep(after).await;
                        code
                    }
                    None => std::future::pending().await,
                }
            };
            let code = tokio::select! {
                _ = kill_rx => None,
                code = exit_rx => code.ok(),
                code = crashed => Some(code),
            };
            let _ = exits.send(WorkerExit { port, code });
        });
        Ok(SpawnedWorker::new(Some(u32::from(port)), kill_tx, monitor))
    }
}

#[derive(Default, Clone)]
struct Behaviour {
    /// Per-port run duration; 10ms when absent.
    run_delay: HashMap<u16, Duration>,
    fail_connect: Option<u16>,
    fail_run: Option<u16>,
    fail_status: Option<u16>,
    fail_terminate: Option<u16>,
}

struct FakeConnector {
    behaviour: Behaviour,
    switches: ExitSwitches,
    log: CallLog,
    connects: Mutex<Vec<u16>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, transport: &Transport) -> Result<Arc<dyn WorkerClient>, RpcError> {
        self.connects.lock().unwrap().push(transport.port);
        if self.behaviour.fail_connect == Some(transport.port) {
            return Err(RpcError::Timeout(Duration::from_millis(100)));
        }
        Ok(Arc::new(FakeClient {
            port: transport.port,
            behaviour: self.behaviour.clone(),
            switches: Arc::clone(&self.switches),
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeClient {
    port: u16,
    behaviour: Behaviour,
    switches: ExitSwitches,
    log: CallLog,
}

#[async_trait]
impl WorkerClient for FakeClient {
    async fn run(&self, task_id: TaskId, payload: &Payload) -> Result<TaskOutput, RpcError> {
        self.log.lock().unwrap().push(Call::Run {
            task: task_id,
            port: self.port,
        });
        let delay = self
            .behaviour
            .run_delay
            .get(&self.port)
            .copied()
            .unwrap_or(Duration::from_millis(10));
        tokio::time::sleep(delay).await;
        if self.behaviour.fail_run == Some(self.port) {
            return Err(RpcError::Remote("filter blew up".into()));
        }
        payload
            .execute()
            .map_err(|e| RpcError::Remote(e.to_string()))
    }

    async fn status(&self) -> Result<String, RpcError> {
        self.log.lock().unwrap().push(Call::Status(self.port));
        if self.behaviour.fail_status == Some(self.port) {
            return Err(RpcError::Transport("reply channel closed".into()));
        }
        Ok(format!("worker {} operational", self.port))
    }

    async fn terminate(&self) -> Result<String, RpcError> {
        self.log.lock().unwrap().push(Call::Terminate(self.port));
        if self.behaviour.fail_terminate == Some(self.port) {
            return Err(RpcError::Transport("reply channel closed".into()));
        }
        if let Some(exit) = self.switches.lock().unwrap().remove(&self.port) {
            let _ = exit.send(0);
        }
        Ok(format!("worker {} terminating...", self.port))
    }
}

struct Harness {
    controller: Controller,
    spawner: Arc<FakeSpawner>,
    connector: Arc<FakeConnector>,
    log: CallLog,
}

impl Harness {
    fn new(workers: usize, behaviour: Behaviour) -> Self {
        Self::with_spawner(workers, behaviour, FakeSpawner::default())
    }

    fn with_spawner(workers: usize, behaviour: Behaviour, spawner: FakeSpawner) -> Self {
        let log: CallLog = Arc::default();
        let spawner = Arc::new(spawner);
        let connector = Arc::new(FakeConnector {
            behaviour,
            switches: Arc::clone(&spawner.switches),
            log: Arc::clone(&log),
            connects: Mutex::default(),
        });
        let controller = Controller::new(
            config(workers, 0),
            Arc::clone(&spawner) as Arc<dyn Spawner>,
            Arc::clone(&connector) as Arc<dyn Connector>,
        );
        Self {
            controller,
            spawner,
            connector,
            log,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    fn runs(&self) -> Vec<(TaskId, u16)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run { task, port } => Some((task, port)),
                _ => None,
            })
            .collect()
    }

    fn terminated_ports(&self) -> HashSet<u16> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Terminate(port) => Some(port),
                _ => None,
            })
            .collect()
    }
}

fn config(workers: usize, status_check_delay_ms: u64) -> DroverConfig {
    DroverConfig {
        pool: PoolConfig {
            host: "127.0.0.1".into(),
            base_port: BASE_PORT,
            worker_program: "drover-worker".into(),
            worker_args: Vec::new(),
            cores: Some(workers),
        },
        timing: TimingConfig {
            startup_delay_ms: 0,
            start_poll_ms: 5,
            connect_timeout_ms: 100,
            status_check_delay_ms,
            terminate_grace_ms: 0,
            shutdown_timeout_ms: 200,
        },
        tasks: Vec::new(),
    }
}

fn batch(n: usize) -> Vec<(String, Payload)> {
    (0..n)
        .map(|i| {
            let payload = if i % 2 == 0 {
                Payload::from(XmlFilter::new(500))
            } else {
                Payload::from(XslFilter::new(500))
            };
            (format!("t{i}"), payload)
        })
        .collect()
}

fn ports(range: std::ops::Range<u16>) -> HashSet<u16> {
    range.map(|i| BASE_PORT + i).collect()
}

#[test]
fn submit_assigns_ids_in_order() {
    let mut h = Harness::new(1, Behaviour::default());
    assert_eq!(h.controller.submit(batch(2)), vec![TaskId(0), TaskId(1)]);
    assert_eq!(h.controller.submit(batch(1)), vec![TaskId(2)]);
    assert_eq!(h.controller.tasks().len(), 3);
    assert!(h
        .controller
        .tasks()
        .iter()
        .all(|t| t.status() == TaskStatus::Created));
    assert_eq!(h.controller.state(), ControllerState::Disconnected);
    assert!(!h.controller.is_connected());
}

#[tokio::test]
async fn three_tasks_on_two_workers() {
    let behaviour = Behaviour {
        run_delay: HashMap::from([
            (BASE_PORT, Duration::from_millis(20)),
            (BASE_PORT + 1, Duration::from_millis(300)),
        ]),
        ..Default::default()
    };
    let mut h = Harness::new(2, behaviour);
    h.controller.submit(batch(3));

    let report = h.controller.start().await.unwrap();

    // Pass 1 pairs task 0/1 with workers 0/1; the faster worker 0 takes task 2.
    assert_eq!(
        h.runs(),
        vec![
            (TaskId(0), BASE_PORT),
            (TaskId(1), BASE_PORT + 1),
            (TaskId(2), BASE_PORT),
        ]
    );
    assert_eq!(report.completed(), 3);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.workers, 2);
    assert_eq!(report.tasks[2].assigned_to(), Some(0));
    assert_eq!(h.controller.state(), ControllerState::Terminated);
    assert_eq!(h.controller.pool().busy_count(), 0);
    assert_eq!(h.terminated_ports(), ports(0..2));
}

#[tokio::test]
async fn single_task_goes_to_lowest_port() {
    let mut h = Harness::new(4, Behaviour::default());
    h.controller.submit(batch(1));

    let report = h.controller.start().await.unwrap();

    assert_eq!(h.runs(), vec![(TaskId(0), BASE_PORT)]);
    assert_eq!(report.completed(), 1);
    assert_eq!(h.terminated_ports(), ports(0..4));
}

#[tokio::test]
async fn remote_result_matches_local_execution() {
    let mut h = Harness::new(2, Behaviour::default());
    let submitted = batch(4);
    h.controller.submit(submitted.clone());

    let report = h.controller.start().await.unwrap();

    for (task, (_, payload)) in report.tasks.iter().zip(&submitted) {
        assert_eq!(task.output(), Some(&payload.execute().unwrap()));
    }
}

#[tokio::test]
async fn connect_failure_stops_before_any_run() {
    let behaviour = Behaviour {
        fail_connect: Some(BASE_PORT + 2),
        ..Default::default()
    };
    let mut h = Harness::new(3, behaviour);
    h.controller.submit(batch(3));

    match h.controller.start().await {
        Err(SchedulerError::Connect { address, .. }) => assert_eq!(address, "127.0.0.1:9102"),
        other => panic!("expected connect error, got {other:?}"),
    }
    assert!(h.runs().is_empty());
    assert_eq!(h.controller.state(), ControllerState::Terminated);
    assert!(h
        .controller
        .tasks()
        .iter()
        .all(|t| t.status() == TaskStatus::Created));
}

#[tokio::test]
async fn spawn_failure_never_connects() {
    let spawner = FakeSpawner {
        fail_port: Some(BASE_PORT + 1),
        ..Default::default()
    };
    let mut h = Harness::with_spawner(2, Behaviour::default(), spawner);
    h.controller.submit(batch(2));

    match h.controller.start().await {
        Err(SchedulerError::Spawn { port, .. }) => assert_eq!(port, BASE_PORT + 1),
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert_eq!(*h.spawner.spawned.lock().unwrap(), vec![BASE_PORT]);
    assert!(h.connector.connects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn first_pass_assigns_min_of_pending_and_idle() {
    for (tasks, workers) in [(1, 1), (2, 5), (5, 2), (4, 4)] {
        let behaviour = Behaviour {
            run_delay: (0..workers as u16)
                .map(|i| (BASE_PORT + i, Duration::from_secs(30)))
                .collect(),
            ..Default::default()
        };
        let mut h = Harness::new(workers, behaviour);
        h.controller.submit(batch(tasks));
        h.controller.connect().await.unwrap();
        assert_eq!(h.controller.state(), ControllerState::Ready);

        h.controller.schedule_pass().await.unwrap();

        let expected = tasks.min(workers);
        let running: Vec<_> = h
            .controller
            .tasks()
            .iter()
            .filter(|t| t.status() == TaskStatus::Running)
            .collect();
        assert_eq!(running.len(), expected);
        assert_eq!(h.controller.pool().busy_count(), expected);

        // Submission order onto pool order, one task per worker.
        for (i, task) in running.iter().enumerate() {
            assert_eq!(task.id, TaskId(i));
            assert_eq!(task.assigned_to(), Some(i));
        }
        h.controller.verify_assignments().unwrap();
    }
}

#[tokio::test]
async fn busy_without_running_task_is_an_allocation_error() {
    let mut h = Harness::new(2, Behaviour::default());
    h.controller.submit(batch(1));
    h.controller.connect().await.unwrap();

    h.controller.pool.allocate(TaskId(0));

    assert!(matches!(
        h.controller.verify_assignments(),
        Err(SchedulerError::Allocation { .. })
    ));
}

#[tokio::test]
async fn failed_run_aborts_batch() {
    let behaviour = Behaviour {
        fail_run: Some(BASE_PORT + 1),
        run_delay: HashMap::from([(BASE_PORT, Duration::from_secs(30))]),
        ..Default::default()
    };
    let mut h = Harness::new(2, behaviour);
    h.controller.submit(batch(3));

    match h.controller.start().await {
        Err(SchedulerError::RemoteExecution { worker, task, reason }) => {
            assert_eq!(worker, "127.0.0.1:9101");
            assert_eq!(task, Some(TaskId(1)));
            assert!(reason.contains("filter blew up"));
        }
        other => panic!("expected remote execution error, got {other:?}"),
    }
    assert_eq!(h.controller.tasks()[1].status(), TaskStatus::Failed);
    assert_eq!(h.controller.tasks()[2].status(), TaskStatus::Created);
    assert_eq!(h.controller.state(), ControllerState::Terminated);
    assert!(h.terminated_ports().is_empty());
}

#[tokio::test]
async fn worker_exit_fails_its_task() {
    let spawner = FakeSpawner {
        crash: Some((BASE_PORT, Duration::from_millis(50), 3)),
        ..Default::default()
    };
    let behaviour = Behaviour {
        run_delay: HashMap::from([(BASE_PORT, Duration::from_secs(30))]),
        ..Default::default()
    };
    let mut h = Harness::with_spawner(1, behaviour, spawner);
    h.controller.submit(batch(1));

    match h.controller.start().await {
        Err(SchedulerError::RemoteExecution { worker, task, reason }) => {
            assert_eq!(worker, "127.0.0.1:9100");
            assert_eq!(task, Some(TaskId(0)));
            assert!(reason.contains("code 3"), "{reason}");
        }
        other => panic!("expected remote execution error, got {other:?}"),
    }
    assert_eq!(h.controller.tasks()[0].status(), TaskStatus::Failed);
    assert_eq!(
        h.controller.pool().handles()[0].status(),
        WorkerStatus::Unreachable
    );
}

#[tokio::test]
async fn terminate_failure_is_fatal() {
    let behaviour = Behaviour {
        fail_terminate: Some(BASE_PORT + 1),
        ..Default::default()
    };
    let mut h = Harness::new(2, behaviour);
    h.controller.submit(batch(2));

    match h.controller.start().await {
        Err(SchedulerError::RemoteExecution { worker, task, reason }) => {
            assert_eq!(worker, "127.0.0.1:9101");
            assert_eq!(task, None);
            assert!(reason.starts_with("terminate failed"));
        }
        other => panic!("expected remote execution error, got {other:?}"),
    }
    assert!(h
        .controller
        .tasks()
        .iter()
        .all(|t| t.status() == TaskStatus::Completed));
}

#[tokio::test]
async fn empty_batch_terminates_right_away() {
    let mut h = Harness::new(3, Behaviour::default());

    let report = h.controller.start().await.unwrap();

    assert!(report.tasks.is_empty());
    assert!(h.runs().is_empty());
    assert_eq!(h.terminated_ports(), ports(0..3));
}

#[tokio::test]
async fn check_status_reports_every_worker() {
    let mut h = Harness::new(2, Behaviour::default());
    h.controller.connect().await.unwrap();

    let statuses = h.controller.check_status().await.unwrap();

    assert_eq!(
        statuses,
        vec![
            ("127.0.0.1:9100".to_string(), "worker 9100 operational".to_string()),
            ("127.0.0.1:9101".to_string(), "worker 9101 operational".to_string()),
        ]
    );
}

#[tokio::test]
async fn delayed_status_probe_runs_during_batch() {
    let behaviour = Behaviour {
        run_delay: HashMap::from([
            (BASE_PORT, Duration::from_millis(200)),
            (BASE_PORT + 1, Duration::from_millis(200)),
        ]),
        ..Default::default()
    };
    let mut h = Harness::new(2, behaviour);
    h.controller.config = config(2, 20);
    h.controller.submit(batch(2));

    h.controller.start().await.unwrap();

    let probed: HashSet<u16> = h
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Status(port) => Some(port),
            _ => None,
        })
        .collect();
    assert_eq!(probed, ports(0..2));
}

#[tokio::test]
async fn failing_status_probe_is_fatal() {
    let behaviour = Behaviour {
        fail_status: Some(BASE_PORT),
        run_delay: HashMap::from([(BASE_PORT, Duration::from_secs(30))]),
        ..Default::default()
    };
    let mut h = Harness::new(1, behaviour);
    h.controller.config = config(1, 20);
    h.controller.submit(batch(1));

    match h.controller.start().await {
        Err(SchedulerError::RemoteExecution { reason, .. }) => {
            assert!(reason.starts_with("status failed"))
        }
        other => panic!("expected remote execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn start_after_termination_is_rejected() {
    let mut h = Harness::new(1, Behaviour::default());
    h.controller.submit(batch(1));
    h.controller.start().await.unwrap();

    assert!(matches!(
        h.controller.start().await,
        Err(SchedulerError::State(_))
    ));
}

#[tokio::test]
async fn check_status_after_termination_is_a_state_error() {
    let mut h = Harness::new(2, Behaviour::default());
    h.controller.submit(batch(2));
    h.controller.start().await.unwrap();

    assert!(!h.controller.is_connected());
    assert!(h.controller.pool().handles().iter().all(|w| !w.is_connected()));
    let checked = tokio::time::timeout(Duration::from_secs(1), h.controller.check_status())
        .await
        .expect("check_status must not wait on terminated workers");
    assert!(matches!(checked, Err(SchedulerError::State(_))));
}

#[tokio::test]
async fn aborted_run_detaches_every_channel() {
    let behaviour = Behaviour {
        fail_run: Some(BASE_PORT),
        ..Default::default()
    };
    let mut h = Harness::new(2, behaviour);
    h.controller.submit(batch(1));

    assert!(h.controller.start().await.is_err());

    assert_eq!(h.controller.state(), ControllerState::Terminated);
    assert!(h.controller.pool().channels().is_empty());
    assert!(matches!(
        h.controller.check_status().await,
        Err(SchedulerError::State(_))
    ));
}

#[tokio::test]
async fn check_status_before_connect_is_a_state_error() {
    let h = Harness::new(1, Behaviour::default());
    assert!(matches!(
        h.controller.check_status().await,
        Err(SchedulerError::State(_))
    ));
    assert!(h.calls().is_empty());
}
