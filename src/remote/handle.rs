use crate::intervention_graph::Graph;
use crate::remote::blocking::{RemoteObserver, apply_result, download_result};
use crate::remote::transport::JobTransport;
use crate::remote::{JobRequest, JobStatus, RemoteError, StatusEvent, StatusTracker};
use crate::value::Value;

/// A job submitted without waiting. Poll it until completed, then fetch the result.
#[derive(Debug, Clone)]
pub struct JobHandle {
    last: StatusEvent,
    tracker: StatusTracker,
}

impl JobHandle {
    pub async fn submit<T: JobTransport>(
        transport: &T,
        request: &JobRequest,
    ) -> Result<Self, RemoteError> {
        let event = transport.submit(request.payload()).await?;
        log::info!("{} - {}: {}", event.id, event.status, event.message);
        Ok(Self {
            tracker: StatusTracker::for_job(event.id.clone(), event.status),
            last: event,
        })
    }

    pub fn id(&self) -> &str {
        self.tracker.id()
    }

    pub fn status(&self) -> JobStatus {
        self.last.status
    }

    pub fn last_event(&self) -> &StatusEvent {
        &self.last
    }

    pub async fn poll<T: JobTransport>(
        &mut self,
        transport: &T,
    ) -> Result<&StatusEvent, RemoteError> {
        let event = transport.status(&self.last.id).await?;
        if !self.tracker.accept(&event)? {
            return Err(RemoteError::Protocol(format!(
                "asked for job {}, got status of {}",
                self.last.id, event.id
            )));
        }
        self.last = event;
        Ok(&self.last)
    }

    /// Downloads the result of a completed job and writes its saves into `graph`.
    pub async fn fetch<T, O>(
        &self,
        transport: &T,
        graph: &mut Graph,
        observer: &mut O,
    ) -> Result<Option<Value>, RemoteError>
    where
        T: JobTransport,
        O: RemoteObserver + ?Sized,
    {
        match self.last.status {
            JobStatus::Completed => {}
            JobStatus::Error => {
                return Err(RemoteError::Job {
                    id: self.last.id.clone(),
                    message: self.last.message.clone(),
                });
            }
            status => {
                return Err(RemoteError::NotReady {
                    id: self.last.id.clone(),
                    status,
                });
            }
        }
        let result = download_result(transport, &self.last.id, observer).await?;
        apply_result(graph, &result)?;
        Ok(result.output)
    }
}
