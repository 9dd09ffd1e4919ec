pub mod accum;
pub mod intervention_graph;
pub mod model;
pub mod remote;
pub mod runner;
pub mod value;

pub use accum::{Accumulator, Bridge};
pub use intervention_graph::{Graph, GraphError, NodeRef};
pub use model::{InterventionModel, ModelError, SequentialModel};
pub use runner::{RunOutcome, Runner, RunnerConfig, RunnerError};
pub use value::{ProxyValue, Value};
