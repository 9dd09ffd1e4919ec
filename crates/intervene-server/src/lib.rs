use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use intervene::InterventionModel;
use intervene::remote::{ClientMessage, JobPayload, JobStatus, ServerMessage, StatusEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, mpsc};
use tower_http::trace::TraceLayer;

pub mod scheduler;

use scheduler::SchedulerJob;

pub const BIND_VAR: &str = "INTERVENE_BIND";
pub const DEFAULT_BIND: &str = "0.0.0.0:5001";
/// How long a finished job stays queryable when its result is never fetched.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

pub type SharedModel = Arc<dyn InterventionModel + Send + Sync>;

struct JobRecord {
    status: StatusEvent,
    result: Option<Arc<Vec<u8>>>,
    finished: Option<Instant>,
}

/// In-memory job service state: registered models, job records and the status feed.
pub struct JobServer {
    models: RwLock<HashMap<String, SharedModel>>,
    jobs: RwLock<HashMap<String, JobRecord>>,
    status_sender: broadcast::Sender<StatusEvent>,
    job_sender: mpsc::Sender<SchedulerJob>,
    retention: Duration,
}

pub enum ResultLookup {
    Ready(Arc<Vec<u8>>),
    NotReady(JobStatus),
    Unknown,
}

impl JobServer {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<SchedulerJob>) {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> (Arc<Self>, mpsc::Receiver<SchedulerJob>) {
        let (status_sender, _) = broadcast::channel(1024);
        let (job_sender, job_receiver) = mpsc::channel(64);
        let server = Arc::new(Self {
            models: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            status_sender,
            job_sender,
            retention,
        });
        (server, job_receiver)
    }

    pub async fn register_model(&self, model: SharedModel) {
        let id = model.identifier().to_string();
        tracing::info!("Registered model {id}");
        self.models.write().await.insert(id, model);
    }

    pub(crate) async fn get_model(&self, id: &str) -> Option<SharedModel> {
        self.models.read().await.get(id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_sender.subscribe()
    }

    /// Records a new job as queued and hands it to the scheduler.
    pub async fn submit(&self, payload: JobPayload) -> StatusEvent {
        let id = uuid::Uuid::new_v4().to_string();
        let queued = StatusEvent::new(
            &id,
            JobStatus::Queued,
            "Your job has been received and is waiting approval.",
        );
        {
            let mut jobs = self.jobs.write().await;
            self.prune(&mut jobs);
            jobs.insert(
                id.clone(),
                JobRecord {
                    status: queued.clone(),
                    result: None,
                    finished: None,
                },
            );
        }
        self.status_sender.send(queued.clone()).ok();
        if let Err(err) = self
            .job_sender
            .send(SchedulerJob::Run {
                id: id.clone(),
                payload,
            })
            .await
        {
            tracing::error!("Scheduler is gone: {err}");
            let failed = StatusEvent::new(&id, JobStatus::Error, "Job scheduler is not running");
            self.update_status(failed.clone()).await;
            return failed;
        }
        queued
    }

    pub(crate) async fn update_status(&self, event: StatusEvent) {
        tracing::info!("{} - {}: {}", event.id, event.status, event.message);
        if let Some(record) = self.jobs.write().await.get_mut(&event.id) {
            if event.status.is_terminal() {
                record.finished.get_or_insert_with(Instant::now);
            }
            record.status = event.clone();
        }
        self.status_sender.send(event).ok();
    }

    pub(crate) async fn store_result(&self, id: &str, data: Vec<u8>) {
        if let Some(record) = self.jobs.write().await.get_mut(id) {
            record.result = Some(Arc::new(data));
        }
    }

    pub async fn status(&self, id: &str) -> Option<StatusEvent> {
        self.jobs.read().await.get(id).map(|r| r.status.clone())
    }

    /// Hands out a completed result. The job is forgotten once its result has been fetched.
    pub async fn result(&self, id: &str) -> ResultLookup {
        let mut jobs = self.jobs.write().await;
        let lookup = match jobs.get(id) {
            None => ResultLookup::Unknown,
            Some(JobRecord {
                result: Some(data),
                status,
                ..
            }) if status.status == JobStatus::Completed => ResultLookup::Ready(data.clone()),
            Some(record) => ResultLookup::NotReady(record.status.status),
        };
        if matches!(lookup, ResultLookup::Ready(_)) {
            jobs.remove(id);
        }
        lookup
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    fn prune(&self, jobs: &mut HashMap<String, JobRecord>) {
        let before = jobs.len();
        jobs.retain(|_, record| {
            record
                .finished
                .is_none_or(|finished| finished.elapsed() < self.retention)
        });
        if jobs.len() < before {
            tracing::debug!("Dropped {} expired jobs", before - jobs.len());
        }
    }
}

async fn send_message(socket: &mut WebSocket, message: ServerMessage) -> bool {
    match serde_json::to_string(&message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            tracing::error!("Failed to encode message: {err}");
            false
        }
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<JobServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| handle_socket(socket, server))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<JobServer>) {
    // Subscribe before submitting so no status of our own jobs is missed.
    let mut statuses = server.subscribe();
    let mut watching = HashSet::new();

    loop {
        tokio::select! {
            event = statuses.recv() => {
                match event {
                    Ok(event) => {
                        if !watching.contains(&event.id) {
                            continue;
                        }
                        if event.status.is_terminal() {
                            watching.remove(&event.id);
                        }
                        let message = ServerMessage::BlockingResponse(event);
                        if !send_message(&mut socket, message).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Status feed lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::BlockingRequest(payload)) => {
                                let accepted = server.submit(payload).await;
                                if !accepted.status.is_terminal() {
                                    watching.insert(accepted.id.clone());
                                }
                                let message = ServerMessage::BlockingAccepted(accepted);
                                if !send_message(&mut socket, message).await {
                                    break;
                                }
                            }
                            Err(err) => {
                                log::warn!("Failed to decode the message: {err}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::error!("Error receiving message: {err}");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("WebSocket connection closed");
}

async fn submit_handler(
    State(server): State<Arc<JobServer>>,
    Json(payload): Json<JobPayload>,
) -> Json<StatusEvent> {
    Json(server.submit(payload).await)
}

async fn status_handler(
    State(server): State<Arc<JobServer>>,
    Path(id): Path<String>,
) -> Result<Json<StatusEvent>, StatusCode> {
    server.status(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn result_handler(
    State(server): State<Arc<JobServer>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match server.result(&id).await {
        ResultLookup::Ready(data) => Ok((
            [(header::CONTENT_TYPE, "application/cbor")],
            data.as_ref().clone(),
        )),
        ResultLookup::NotReady(status) => Err((
            StatusCode::CONFLICT,
            format!("Job {id} is {status}"),
        )),
        ResultLookup::Unknown => Err((StatusCode::NOT_FOUND, format!("Unknown job {id}"))),
    }
}

pub fn router(server: Arc<JobServer>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(websocket_handler))
        .route("/request", post(submit_handler))
        .route("/response/{id}", get(status_handler))
        .route("/result/{id}", get(result_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// Runs the scheduler and serves the job API on `listener` until the server stops.
pub async fn serve(
    listener: tokio::net::TcpListener,
    server: Arc<JobServer>,
    jobs: mpsc::Receiver<SchedulerJob>,
) -> std::io::Result<()> {
    tokio::spawn(scheduler::scheduler(jobs, server.clone()));
    axum::serve(listener, router(server)).await
}
