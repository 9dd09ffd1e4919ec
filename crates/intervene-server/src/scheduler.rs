use crate::JobServer;
use intervene::remote::{JobPayload, JobResult, JobStatus, StatusEvent};
use intervene::{Graph, InterventionModel, Runner, RunnerConfig};
use log::error;
use std::sync::Arc;
use tokio::sync::mpsc;

pub enum SchedulerJob {
    Run { id: String, payload: JobPayload },
}

/// Executes one job payload against `model` and encodes the result blob.
pub fn run_job(
    model: &(dyn InterventionModel + Send + Sync),
    payload: JobPayload,
) -> anyhow::Result<Vec<u8>> {
    let graph = Graph::from_spec(&payload.intervention_graph)?;
    let config = RunnerConfig {
        generation: payload.generation,
        ..Default::default()
    };
    let mut runner =
        Runner::new(model, graph, payload.batched_input, config).with_args(payload.args);
    for (name, value) in payload.kwargs {
        runner = runner.with_kwarg(name, value);
    }
    runner.run_local()?;
    let result = JobResult {
        saves: runner.graph().saves(),
        output: if payload.include_output {
            runner.output().cloned()
        } else {
            None
        },
    };
    Ok(result.to_bytes()?)
}

pub async fn scheduler(mut input: mpsc::Receiver<SchedulerJob>, server: Arc<JobServer>) {
    while let Some(job) = input.recv().await {
        match job {
            SchedulerJob::Run { id, payload } => {
                let Some(model) = server.get_model(&payload.model_identifier).await else {
                    let message = format!("Model {} is not available", payload.model_identifier);
                    server
                        .update_status(StatusEvent::new(&id, JobStatus::Error, message))
                        .await;
                    continue;
                };
                server
                    .update_status(StatusEvent::new(
                        &id,
                        JobStatus::Running,
                        "Your job has started running.",
                    ))
                    .await;
                // Dispatch tight loop
                let resp =
                    tokio::task::spawn_blocking(move || run_job(model.as_ref(), payload)).await;
                let event = match resp {
                    Ok(Ok(data)) => {
                        server.store_result(&id, data).await;
                        StatusEvent::new(&id, JobStatus::Completed, "Your job has been completed.")
                    }
                    Ok(Err(err)) => StatusEvent::new(&id, JobStatus::Error, format!("{err:#}")),
                    Err(err) => {
                        error!("Job {id} panicked: {err}");
                        StatusEvent::new(&id, JobStatus::Error, "Job execution aborted")
                    }
                };
                server.update_status(event).await;
            }
        }
    }
}
