use crate::intervention_graph::{Graph, GraphError, GraphId, NodeRef};
use crate::value::Value;

pub mod iterator;

pub use iterator::Iterator;

/// Shared signal telling accumulating protocols whether the current pass publishes its result.
#[derive(Debug, Clone)]
pub struct Bridge {
    root: GraphId,
    release: bool,
}

impl Bridge {
    pub fn new(root: GraphId) -> Self {
        Self {
            root,
            release: false,
        }
    }

    pub fn root(&self) -> GraphId {
        self.root
    }

    pub fn release(&self) -> bool {
        self.release
    }

    pub(crate) fn set_release(&mut self, release: bool) {
        self.release = release;
    }
}

/// Owns a graph and the single bridge every iteration scope inside it shares.
#[derive(Debug)]
pub struct Accumulator {
    graph: Graph,
    bridge: Bridge,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self::with_graph(Graph::new())
    }

    pub fn with_graph(graph: Graph) -> Self {
        let bridge = Bridge::new(graph.id());
        Self { graph, bridge }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Opens an iteration scope over `data`, returning the current-item handle and the scope.
    pub fn iterate(&mut self, data: Vec<Value>) -> Result<(NodeRef, Iterator), GraphError> {
        Iterator::enter(self, data)
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }
}
