use crate::intervention_graph::Graph;
use crate::remote::transport::{JobConnection, JobTransport, ResultDownload};
use crate::remote::{
    JobRequest, JobResult, JobStatus, RemoteError, StatusEvent, StatusTracker,
};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BlockingState {
    Connecting,
    Submitted,
    AwaitingStatus,
    Downloading,
    Complete,
    Errored,
    DisconnectedIncomplete,
}

impl BlockingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockingState::Complete
                | BlockingState::Errored
                | BlockingState::DisconnectedIncomplete
        )
    }
}

pub trait RemoteObserver {
    fn on_state(&mut self, _state: BlockingState) {}
    fn on_status(&mut self, _event: &StatusEvent) {}
    fn on_download_progress(&mut self, _received: u64, _total: Option<u64>) {}
}

impl RemoteObserver for () {}

/// Reports job progress through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RemoteObserver for LogObserver {
    fn on_state(&mut self, state: BlockingState) {
        log::debug!("Remote execution: {state}");
    }

    fn on_status(&mut self, event: &StatusEvent) {
        log::info!("{} - {}: {}", event.id, event.status, event.message);
    }

    fn on_download_progress(&mut self, received: u64, total: Option<u64>) {
        match total {
            Some(total) => log::debug!("Downloading result: {received}/{total} bytes"),
            None => log::debug!("Downloading result: {received} bytes"),
        }
    }
}

/// Upper bound on the buffer reserved from a declared length, which only drives progress.
const MAX_PREALLOC: usize = 1 << 20;

/// Streams the result blob of a completed job. A blob shorter than declared is an error.
pub(crate) async fn download_result<T, O>(
    transport: &T,
    id: &str,
    observer: &mut O,
) -> Result<JobResult, RemoteError>
where
    T: JobTransport,
    O: RemoteObserver + ?Sized,
{
    let mut download = transport.download(id).await?;
    let total = download.total_len();
    let capacity = total
        .and_then(|t| usize::try_from(t).ok())
        .unwrap_or(0)
        .min(MAX_PREALLOC);
    let mut blob = Vec::with_capacity(capacity);
    while let Some(chunk) = download.next_chunk().await? {
        blob.extend_from_slice(&chunk);
        observer.on_download_progress(blob.len() as u64, total);
    }
    if let Some(total) = total {
        if (blob.len() as u64) < total {
            return Err(RemoteError::Deserialization(format!(
                "result of job {id} ended after {} of {total} bytes",
                blob.len()
            )));
        }
    }
    JobResult::from_bytes(&blob)
}

/// Writes every saved value into the node of the same name. Nothing is written unless all
/// names resolve.
pub fn apply_result(graph: &mut Graph, result: &JobResult) -> Result<(), RemoteError> {
    if let Some(missing) = result.saves.keys().find(|name| graph.get(name).is_none()) {
        return Err(RemoteError::UnknownSave(missing.clone()));
    }
    for (name, value) in &result.saves {
        graph.set_value(name, value.clone())?;
    }
    Ok(())
}

async fn drive<T, O>(
    transport: &T,
    connection: &mut T::Connection,
    request: &JobRequest,
    graph: &mut Graph,
    observer: &mut O,
) -> Result<Option<Value>, RemoteError>
where
    T: JobTransport,
    O: RemoteObserver + ?Sized,
{
    let accepted = connection.submit(request.payload()).await?;
    observer.on_state(BlockingState::Submitted);

    let mut tracker = StatusTracker::new(accepted.id.clone());
    observer.on_state(BlockingState::AwaitingStatus);
    let mut pending = Some(accepted);
    let id = loop {
        let event = match pending.take() {
            Some(event) => event,
            None => connection.next_event().await?.ok_or_else(|| {
                RemoteError::Connection(
                    "job service closed the connection before the job finished".to_string(),
                )
            })?,
        };
        if !tracker.accept(&event)? {
            log::debug!("Ignoring status of unrelated job {}", event.id);
            continue;
        }
        observer.on_status(&event);
        match event.status {
            JobStatus::Completed => break event.id,
            JobStatus::Error => {
                return Err(RemoteError::Job {
                    id: event.id,
                    message: event.message,
                });
            }
            JobStatus::Queued | JobStatus::Running => {}
        }
    };

    observer.on_state(BlockingState::Downloading);
    let result = download_result(transport, &id, observer).await?;
    apply_result(graph, &result)?;
    Ok(result.output)
}

/// Runs a request to completion over one connection: submit, follow status events, download
/// the result and splice saved values into `graph`. On any failure `graph` is left untouched.
pub async fn execute_blocking<T, O>(
    transport: &T,
    request: &JobRequest,
    graph: &mut Graph,
    observer: &mut O,
) -> Result<Option<Value>, RemoteError>
where
    T: JobTransport,
    O: RemoteObserver + ?Sized,
{
    observer.on_state(BlockingState::Connecting);
    let mut connection = match transport.connect().await {
        Ok(connection) => connection,
        Err(err) => {
            observer.on_state(BlockingState::DisconnectedIncomplete);
            return Err(err);
        }
    };
    let outcome = drive(transport, &mut connection, request, graph, observer).await;
    if let Err(err) = connection.close().await {
        log::warn!("Closing job connection failed: {err}");
    }
    observer.on_state(match &outcome {
        Ok(_) => BlockingState::Complete,
        Err(RemoteError::Connection(_)) => BlockingState::DisconnectedIncomplete,
        Err(_) => BlockingState::Errored,
    });
    outcome
}
