use crate::intervention_graph::{GraphError, GraphSpec};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

pub mod blocking;
pub mod config;
pub mod handle;
pub mod transport;

pub use blocking::{BlockingState, LogObserver, RemoteObserver, execute_blocking};
pub use config::RemoteConfig;
pub use handle::JobHandle;
pub use transport::{JobConnection, JobTransport, NetworkTransport, ResultDownload};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Job {id} failed: {message}")]
    Job { id: String, message: String },
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Could not decode job result: {0}")]
    Deserialization(String),
    #[error("Result saves node {0}, which is not in the local graph")]
    UnknownSave(String),
    #[error("Job {id} went from {from} back to {to}")]
    StatusRegression {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Job {id} is {status}, result not available")]
    NotReady { id: String, status: JobStatus },
    #[error("Unexpected message from job service: {0}")]
    Protocol(String),
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    SerdeJSONError(#[from] serde_json::Error),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Position in the job life cycle. Status never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Error => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
}

impl StatusEvent {
    pub fn new(id: impl Into<String>, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            message: message.into(),
        }
    }
}

/// Tracks the last status of one job and rejects regressions.
#[derive(Debug, Clone)]
pub(crate) struct StatusTracker {
    id: String,
    last: Option<JobStatus>,
}

impl StatusTracker {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last: None,
        }
    }

    pub(crate) fn for_job(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            last: Some(status),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Returns false for events that belong to another job.
    pub(crate) fn accept(&mut self, event: &StatusEvent) -> Result<bool, RemoteError> {
        if event.id != self.id {
            return Ok(false);
        }
        if let Some(last) = self.last {
            if event.status.rank() < last.rank() || (last.is_terminal() && event.status != last) {
                return Err(RemoteError::StatusRegression {
                    id: event.id.clone(),
                    from: last,
                    to: event.status,
                });
            }
        }
        self.last = Some(event.status);
        Ok(true)
    }
}

/// What the job service receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub model_identifier: String,
    pub batched_input: Value,
    pub intervention_graph: GraphSpec,
    pub generation: bool,
    pub include_output: bool,
}

/// A job request. The payload goes on the wire; the rest stays local.
#[derive(Debug, Clone)]
pub struct JobRequest {
    payload: JobPayload,
    pub session_id: Option<String>,
    pub received: Option<SystemTime>,
    pub blocking: bool,
    pub id: Option<String>,
}

impl JobRequest {
    pub fn new(payload: JobPayload, blocking: bool) -> Self {
        Self {
            payload,
            session_id: None,
            received: None,
            blocking,
            id: None,
        }
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub saves: BTreeMap<String, Value>,
    pub output: Option<Value>,
}

impl JobResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RemoteError> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|err| RemoteError::Protocol(format!("encoding result: {err}")))?;
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RemoteError> {
        ciborium::from_reader(data).map_err(|err| RemoteError::Deserialization(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    BlockingRequest(JobPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after a blocking request, naming the job the socket now follows.
    BlockingAccepted(StatusEvent),
    BlockingResponse(StatusEvent),
}
