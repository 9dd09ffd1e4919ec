use intervene::intervention_graph::protocols::{
    ConstantProtocol, HookKind, ModuleActivation, SimpleBinary, Target,
};
use intervene::model::AffineLayer;
use intervene::remote::{
    BlockingState, JobConnection, JobPayload, JobResult, JobStatus, JobTransport, RemoteError,
    RemoteObserver, ResultDownload, StatusEvent,
};
use intervene::value::{ArithmeticOp, ValueKind};
use intervene::{
    Graph, NodeRef, ProxyValue, RunOutcome, Runner, RunnerConfig, RunnerError, SequentialModel,
    Value,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct MockLog {
    submitted: Vec<JobPayload>,
    downloads: Vec<String>,
    closed: bool,
}

/// Scripted job service: replays status events and serves a fixed result blob.
struct MockTransport {
    events: Vec<StatusEvent>,
    polls: Mutex<VecDeque<StatusEvent>>,
    result: Vec<u8>,
    declared_len: Option<u64>,
    chunk_size: usize,
    log: Arc<Mutex<MockLog>>,
}

impl MockTransport {
    fn new(events: Vec<StatusEvent>, result: Vec<u8>) -> Self {
        Self {
            events,
            polls: Mutex::new(VecDeque::new()),
            declared_len: Some(result.len() as u64),
            result,
            chunk_size: 100,
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    fn downloads(&self) -> usize {
        self.log.lock().unwrap().downloads.len()
    }

    fn closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }
}

struct MockConnection {
    events: VecDeque<StatusEvent>,
    log: Arc<Mutex<MockLog>>,
}

impl JobConnection for MockConnection {
    async fn submit(&mut self, payload: &JobPayload) -> Result<StatusEvent, RemoteError> {
        self.log.lock().unwrap().submitted.push(payload.clone());
        Ok(event(JobStatus::Queued))
    }

    async fn next_event(&mut self) -> Result<Option<StatusEvent>, RemoteError> {
        Ok(self.events.pop_front())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

struct MockDownload {
    chunks: VecDeque<Vec<u8>>,
    total: Option<u64>,
}

impl ResultDownload for MockDownload {
    fn total_len(&self) -> Option<u64> {
        self.total
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(self.chunks.pop_front())
    }
}

impl JobTransport for MockTransport {
    type Connection = MockConnection;
    type Download = MockDownload;

    async fn connect(&self) -> Result<MockConnection, RemoteError> {
        Ok(MockConnection {
            events: self.events.iter().cloned().collect(),
            log: self.log.clone(),
        })
    }

    async fn submit(&self, payload: &JobPayload) -> Result<StatusEvent, RemoteError> {
        self.log.lock().unwrap().submitted.push(payload.clone());
        Ok(StatusEvent::new("job-1", JobStatus::Queued, "queued"))
    }

    async fn status(&self, _id: &str) -> Result<StatusEvent, RemoteError> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RemoteError::Connection("no status scripted".to_string()))
    }

    async fn download(&self, id: &str) -> Result<MockDownload, RemoteError> {
        self.log.lock().unwrap().downloads.push(id.to_string());
        Ok(MockDownload {
            chunks: self.result.chunks(self.chunk_size).map(<[u8]>::to_vec).collect(),
            total: self.declared_len,
        })
    }
}

#[derive(Default)]
struct Recorder {
    states: Vec<BlockingState>,
    statuses: Vec<JobStatus>,
    progress: Vec<(u64, Option<u64>)>,
}

impl RemoteObserver for Recorder {
    fn on_state(&mut self, state: BlockingState) {
        self.states.push(state);
    }

    fn on_status(&mut self, event: &StatusEvent) {
        self.statuses.push(event.status);
    }

    fn on_download_progress(&mut self, received: u64, total: Option<u64>) {
        self.progress.push((received, total));
    }
}

fn event(status: JobStatus) -> StatusEvent {
    StatusEvent::new("job-1", status, status.to_string())
}

fn toy_model() -> SequentialModel {
    SequentialModel::new(
        "toy",
        vec![AffineLayer::new("layer0", 2.0, 1.0), AffineLayer::new("layer1", 0.5, 0.0)],
    )
}

fn remote_config() -> RunnerConfig {
    RunnerConfig {
        remote: true,
        ..Default::default()
    }
}

/// A graph with one saved node named `x`.
fn graph_with_x() -> (Graph, NodeRef) {
    let mut graph = Graph::new();
    let x = graph
        .create_named(
            "x",
            Target::Constant,
            vec![Value::Int(0).into()],
            ProxyValue::of_kind(ValueKind::Int),
        )
        .unwrap();
    graph.save(&x).unwrap();
    (graph, x)
}

fn saves(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Encodes a result whose blob is exactly `len` bytes, padding through the output string.
fn result_blob(saves: BTreeMap<String, Value>, len: usize) -> Vec<u8> {
    let mut pad = "o".repeat(300);
    loop {
        let bytes = JobResult {
            saves: saves.clone(),
            output: Some(Value::Str(pad.clone())),
        }
        .to_bytes()
        .unwrap();
        if bytes.len() >= len {
            assert_eq!(bytes.len(), len);
            return bytes;
        }
        pad.push('o');
    }
}

#[test]
fn test_local_run_applies_interventions() {
    init_logging();
    let model = toy_model();
    let mut graph = Graph::new();
    let hidden = ModuleActivation::add(&mut graph, "layer0", HookKind::Output, ProxyValue::any());
    let offset = ConstantProtocol::add(&mut graph, Value::Float(10.0));
    let shifted = SimpleBinary::push_new(&mut graph, ArithmeticOp::Add, &hidden, &offset);

    let mut runner = Runner::new(&model, graph, Value::Float(1.0), RunnerConfig::default());
    runner.run_local().unwrap();
    assert_eq!(runner.output(), Some(&Value::Float(1.5)));
    assert_eq!(runner.graph().value(&hidden), Some(&Value::Float(3.0)));
    assert_eq!(runner.graph().value(&shifted), Some(&Value::Float(13.0)));
}

#[test]
fn test_local_generation_returns_every_step() {
    init_logging();
    let model = toy_model();
    let config = RunnerConfig {
        generation: true,
        ..Default::default()
    };
    let mut runner = Runner::new(&model, Graph::new(), Value::Float(1.0), config)
        .with_kwarg(SequentialModel::MAX_NEW_TOKENS, Value::Int(2));
    runner.run_local().unwrap();
    assert_eq!(
        runner.output(),
        Some(&Value::List(vec![Value::Float(1.5), Value::Float(2.0)]))
    );
}

#[tokio::test]
async fn test_run_without_remote_stays_local() {
    init_logging();
    let model = toy_model();
    let transport = MockTransport::new(vec![], vec![]);
    let mut runner = Runner::new(&model, Graph::new(), Value::Float(1.0), RunnerConfig::default());
    let outcome = runner.run(&transport, &mut ()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed));
    assert_eq!(runner.output(), Some(&Value::Float(1.5)));
    assert!(transport.log.lock().unwrap().submitted.is_empty());
}

#[tokio::test]
async fn test_remote_success_splices_saves() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(42))]), 1024);
    let transport = MockTransport::new(
        vec![
            event(JobStatus::Running),
            event(JobStatus::Running),
            event(JobStatus::Completed),
        ],
        blob,
    );
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let mut recorder = Recorder::default();
    runner.run(&transport, &mut recorder).await.unwrap();

    assert_eq!(
        recorder.statuses,
        vec![
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Completed
        ]
    );
    assert_eq!(recorder.progress.last(), Some(&(1024, Some(1024))));
    assert!(recorder.progress.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(runner.graph().value(&x), Some(&Value::Int(42)));
    assert!(matches!(runner.output(), Some(Value::Str(_))));
    assert!(transport.closed());
    assert_eq!(
        recorder.states,
        vec![
            BlockingState::Connecting,
            BlockingState::Submitted,
            BlockingState::AwaitingStatus,
            BlockingState::Downloading,
            BlockingState::Complete,
        ]
    );

    let log = transport.log.lock().unwrap();
    let payload = &log.submitted[0];
    assert_eq!(payload.model_identifier, "toy");
    assert!(payload.intervention_graph.get("x").unwrap().saved);
}

#[tokio::test]
async fn test_remote_error_skips_download() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let transport = MockTransport::new(
        vec![
            event(JobStatus::Queued),
            StatusEvent::new("job-1", JobStatus::Error, "out of memory"),
            event(JobStatus::Completed),
        ],
        result_blob(saves(&[("x", Value::Int(42))]), 512),
    );
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let mut recorder = Recorder::default();
    let err = runner.run(&transport, &mut recorder).await.unwrap_err();

    match err {
        RunnerError::RemoteError(RemoteError::Job { id, message }) => {
            assert_eq!(id, "job-1");
            assert_eq!(message, "out of memory");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(runner.output().is_none());
    assert!(runner.graph().value(&x).is_none());
    assert_eq!(transport.downloads(), 0);
    assert!(transport.closed());
    assert_eq!(recorder.states.last(), Some(&BlockingState::Errored));
}

#[tokio::test]
async fn test_truncated_result_leaves_graph_untouched() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(42))]), 1024);
    let mut transport =
        MockTransport::new(vec![event(JobStatus::Completed)], blob[..600].to_vec());
    transport.declared_len = Some(1024);
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let err = runner.run(&transport, &mut ()).await.unwrap_err();

    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::Deserialization(_))
    ));
    assert!(runner.graph().value(&x).is_none());
    assert!(runner.output().is_none());
}

#[tokio::test]
async fn test_oversized_declared_length_only_drives_progress() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(42))]), 512);
    let mut transport = MockTransport::new(vec![event(JobStatus::Completed)], blob);
    transport.declared_len = Some(u64::MAX);
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let err = runner.run(&transport, &mut ()).await.unwrap_err();

    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::Deserialization(_))
    ));
    assert!(runner.graph().value(&x).is_none());
    assert!(runner.output().is_none());
}

#[tokio::test]
async fn test_events_before_our_job_are_ignored() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(7))]), 256);
    let transport = MockTransport::new(
        vec![
            StatusEvent::new("job-0", JobStatus::Completed, "someone else"),
            event(JobStatus::Running),
            event(JobStatus::Completed),
        ],
        blob,
    );
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let mut recorder = Recorder::default();
    runner.run(&transport, &mut recorder).await.unwrap();

    assert_eq!(
        recorder.statuses,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(transport.log.lock().unwrap().downloads, vec!["job-1".to_string()]);
    assert_eq!(runner.graph().value(&x), Some(&Value::Int(7)));
}

#[tokio::test]
async fn test_malformed_result_leaves_graph_untouched() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let transport = MockTransport::new(vec![event(JobStatus::Completed)], vec![0xff; 64]);
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let err = runner.run(&transport, &mut ()).await.unwrap_err();

    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::Deserialization(_))
    ));
    assert!(runner.graph().value(&x).is_none());
}

#[tokio::test]
async fn test_unknown_save_writes_nothing() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(42)), ("y", Value::Int(1))]), 512);
    let transport = MockTransport::new(vec![event(JobStatus::Completed)], blob);
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let err = runner.run(&transport, &mut ()).await.unwrap_err();

    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::UnknownSave(name)) if name == "y"
    ));
    assert!(runner.graph().value(&x).is_none());
}

#[tokio::test]
async fn test_connection_loss_is_incomplete() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let transport = MockTransport::new(vec![event(JobStatus::Running)], vec![]);
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), remote_config());
    let mut recorder = Recorder::default();
    let err = runner.run(&transport, &mut recorder).await.unwrap_err();

    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::Connection(_))
    ));
    assert!(runner.output().is_none());
    assert!(runner.graph().value(&x).is_none());
    assert_eq!(recorder.states.last(), Some(&BlockingState::DisconnectedIncomplete));
}

#[tokio::test]
async fn test_other_jobs_are_ignored_and_regressions_rejected() {
    init_logging();
    let model = toy_model();
    let blob = result_blob(BTreeMap::new(), 400);
    let transport = MockTransport::new(
        vec![
            event(JobStatus::Running),
            StatusEvent::new("job-2", JobStatus::Error, "not ours"),
            event(JobStatus::Completed),
        ],
        blob.clone(),
    );
    let mut runner = Runner::new(&model, Graph::new(), Value::Float(1.0), remote_config());
    let mut recorder = Recorder::default();
    runner.run(&transport, &mut recorder).await.unwrap();
    assert_eq!(
        recorder.statuses,
        vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
    );

    let transport = MockTransport::new(
        vec![event(JobStatus::Running), event(JobStatus::Queued)],
        blob,
    );
    let mut runner = Runner::new(&model, Graph::new(), Value::Float(1.0), remote_config());
    let err = runner.run(&transport, &mut ()).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::StatusRegression { .. })
    ));
}

#[tokio::test]
async fn test_non_blocking_submit_poll_fetch() {
    init_logging();
    let model = toy_model();
    let (graph, x) = graph_with_x();
    let blob = result_blob(saves(&[("x", Value::Int(7))]), 512);
    let transport = MockTransport::new(vec![], blob);
    transport
        .polls
        .lock()
        .unwrap()
        .extend([event(JobStatus::Running), event(JobStatus::Completed)]);
    let config = RunnerConfig {
        remote: true,
        blocking: false,
        ..Default::default()
    };
    let mut runner = Runner::new(&model, graph, Value::Float(1.0), config);

    let RunOutcome::Pending(mut handle) = runner.run(&transport, &mut ()).await.unwrap() else {
        panic!("expected a pending job");
    };
    assert_eq!(handle.id(), "job-1");
    assert_eq!(handle.status(), JobStatus::Queued);

    let err = runner.resolve(&handle, &transport, &mut ()).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::RemoteError(RemoteError::NotReady { .. })
    ));
    assert_eq!(transport.downloads(), 0);

    assert_eq!(handle.poll(&transport).await.unwrap().status, JobStatus::Running);
    assert_eq!(handle.poll(&transport).await.unwrap().status, JobStatus::Completed);
    runner.resolve(&handle, &transport, &mut ()).await.unwrap();
    assert_eq!(runner.graph().value(&x), Some(&Value::Int(7)));
    assert!(runner.output().is_some());
}
