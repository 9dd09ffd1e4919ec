use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::protocols::{PassContext, Protocol, Target, expect_args};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ProxyValue, Value};

pub struct ConstantProtocol;

impl ConstantProtocol {
    pub fn add(graph: &mut Graph, value: Value) -> NodeRef {
        let proxy_value = ProxyValue::of(&value);
        graph.create(Target::Constant, vec![NodeArg::Literal(value)], proxy_value)
    }
}

impl Protocol for ConstantProtocol {
    fn get_name(&self) -> String {
        "Constant".to_string()
    }

    fn execute(
        &self,
        node: &mut Node,
        mut args: Vec<Value>,
        _ctx: &PassContext,
    ) -> Result<(), GraphError> {
        expect_args(node, &args, 1)?;
        if let Some(value) = args.pop() {
            node.set_value(value);
        }
        Ok(())
    }
}
