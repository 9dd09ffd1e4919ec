use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::protocols::{PassContext, Protocol, Target, expect_args};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ArithmeticOp, Value};

#[derive(Debug, Clone, Copy)]
pub struct SimpleBinary {
    pub(crate) op: ArithmeticOp,
}

impl SimpleBinary {
    pub fn target_for(op: ArithmeticOp) -> Target {
        match op {
            ArithmeticOp::Add => Target::Add,
            ArithmeticOp::Sub => Target::Sub,
            ArithmeticOp::Mul => Target::Mul,
            ArithmeticOp::Div => Target::Div,
        }
    }

    pub fn push_new(
        graph: &mut Graph,
        op: ArithmeticOp,
        lhs: impl Into<NodeArg>,
        rhs: impl Into<NodeArg>,
    ) -> NodeRef {
        let (lhs, rhs) = (lhs.into(), rhs.into());
        let proxy_value = graph.proxy_of(&lhs).combine(&graph.proxy_of(&rhs), op);
        graph.create(Self::target_for(op), vec![lhs, rhs], proxy_value)
    }
}

impl Protocol for SimpleBinary {
    fn get_name(&self) -> String {
        format!("Binary({})", self.op)
    }

    fn execute(
        &self,
        node: &mut Node,
        args: Vec<Value>,
        _ctx: &PassContext,
    ) -> Result<(), GraphError> {
        expect_args(node, &args, 2)?;
        let out = args[0]
            .apply(self.op, &args[1])
            .map_err(|source| GraphError::Evaluation {
                name: node.name().to_string(),
                source,
            })?;
        node.set_value(out);
        Ok(())
    }
}
