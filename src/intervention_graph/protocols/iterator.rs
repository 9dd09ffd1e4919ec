use crate::intervention_graph::node::Node;
use crate::intervention_graph::protocols::{PassContext, Protocol, Target};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ProxyValue, Value};

/// The current item of an iteration scope. Its value is injected by the iterator each pass.
pub struct IteratorItemProtocol;

impl IteratorItemProtocol {
    pub const ATTACHMENT_NAME: &'static str = "iter_idx";

    pub fn node_name(idx: usize) -> String {
        format!("iter_item_{idx}")
    }

    /// Allocates the item node of a new iteration scope and returns it with the scope's index.
    pub fn add(graph: &mut Graph, proxy_value: ProxyValue) -> Result<(NodeRef, usize), GraphError> {
        let idx = graph.attachments_mut().next_index(Self::ATTACHMENT_NAME);
        let node = graph.create_named(Self::node_name(idx), Target::IterItem, vec![], proxy_value)?;
        Ok((node, idx))
    }

    pub fn set(graph: &mut Graph, value: Value, idx: usize) -> Result<(), GraphError> {
        graph.set_value(&Self::node_name(idx), value)
    }
}

impl Protocol for IteratorItemProtocol {
    fn get_name(&self) -> String {
        "IteratorItem".to_string()
    }

    fn execute(
        &self,
        node: &mut Node,
        _args: Vec<Value>,
        _ctx: &PassContext,
    ) -> Result<(), GraphError> {
        Err(GraphError::NotExecutable(node.name().to_string()))
    }
}
