use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::protocols::{PassContext, Protocol, Target, expect_args};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::Value;

/// Running total across iteration passes, published only when the bridge releases it.
pub struct SumProtocol;

impl SumProtocol {
    pub fn add(graph: &mut Graph, value: impl Into<NodeArg>) -> NodeRef {
        let value = value.into();
        let proxy_value = graph.proxy_of(&value);
        graph.create(Target::IterSum, vec![value], proxy_value)
    }
}

impl Protocol for SumProtocol {
    fn get_name(&self) -> String {
        "Sum".to_string()
    }

    fn execute(
        &self,
        node: &mut Node,
        mut args: Vec<Value>,
        ctx: &PassContext,
    ) -> Result<(), GraphError> {
        expect_args(node, &args, 1)?;
        let bridge = ctx
            .bridge()
            .ok_or_else(|| GraphError::MissingBridge(node.name().to_string()))?;
        let Some(current) = args.pop() else {
            return Ok(());
        };
        // An empty slot marks the first pass of this iteration.
        let total = match node.partial_value() {
            None => current,
            Some(total) => total
                .add(&current)
                .map_err(|source| GraphError::Evaluation {
                    name: node.name().to_string(),
                    source,
                })?,
        };
        node.reset();
        if bridge.release() {
            node.set_value(total);
        } else {
            node.store(total);
        }
        Ok(())
    }
}
