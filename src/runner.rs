use crate::intervention_graph::{Graph, GraphError};
use crate::model::{InterventionModel, ModelError};
use crate::remote::{
    JobHandle, JobPayload, JobRequest, JobTransport, RemoteError, RemoteObserver, execute_blocking,
};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    ModelError(#[from] ModelError),
    #[error(transparent)]
    RemoteError(#[from] RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Run the model's generation entry point instead of a single forward pass.
    pub generation: bool,
    pub remote: bool,
    /// Wait for a remote job to finish instead of returning a handle.
    pub blocking: bool,
    pub remote_include_output: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            generation: false,
            remote: false,
            blocking: true,
            remote_include_output: true,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Pending(JobHandle),
}

/// Drives one execution of an intervention graph against a model, locally or remotely.
pub struct Runner<'m, M: InterventionModel + ?Sized> {
    model: &'m M,
    graph: Graph,
    batched_input: Value,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    config: RunnerConfig,
    session_id: Option<String>,
    output: Option<Value>,
}

impl<'m, M: InterventionModel + ?Sized> Runner<'m, M> {
    pub fn new(model: &'m M, graph: Graph, batched_input: Value, config: RunnerConfig) -> Self {
        Self {
            model,
            graph,
            batched_input,
            args: vec![],
            kwargs: BTreeMap::new(),
            config,
            session_id: None,
            output: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn run_local(&mut self) -> Result<(), RunnerError> {
        self.graph.compile()?;
        self.graph.clear();
        let output = if self.config.generation {
            self.model
                .generate(&mut self.graph, &self.batched_input, &self.args, &self.kwargs)?
        } else {
            self.model
                .forward(&mut self.graph, &self.batched_input, &self.args, &self.kwargs)?
        };
        self.output = Some(output);
        Ok(())
    }

    pub fn build_request(&self) -> Result<JobRequest, RunnerError> {
        let payload = JobPayload {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            model_identifier: self.model.identifier().to_string(),
            batched_input: self.batched_input.clone(),
            intervention_graph: self.graph.to_spec()?,
            generation: self.config.generation,
            include_output: self.config.remote_include_output,
        };
        let mut request = JobRequest::new(payload, self.config.blocking);
        request.session_id = self.session_id.clone();
        request.received = Some(SystemTime::now());
        Ok(request)
    }

    /// Runs according to the config. Remote non-blocking runs return a handle to resolve later.
    pub async fn run<T, O>(
        &mut self,
        transport: &T,
        observer: &mut O,
    ) -> Result<RunOutcome, RunnerError>
    where
        T: JobTransport,
        O: RemoteObserver + ?Sized,
    {
        if !self.config.remote {
            self.run_local()?;
            return Ok(RunOutcome::Completed);
        }
        self.graph.compile()?;
        let request = self.build_request()?;
        if self.config.blocking {
            self.output = execute_blocking(transport, &request, &mut self.graph, observer).await?;
            Ok(RunOutcome::Completed)
        } else {
            Ok(RunOutcome::Pending(JobHandle::submit(transport, &request).await?))
        }
    }

    /// Completes a non-blocking run once its job has finished.
    pub async fn resolve<T, O>(
        &mut self,
        handle: &JobHandle,
        transport: &T,
        observer: &mut O,
    ) -> Result<(), RunnerError>
    where
        T: JobTransport,
        O: RemoteObserver + ?Sized,
    {
        self.output = handle.fetch(transport, &mut self.graph, observer).await?;
        Ok(())
    }
}
