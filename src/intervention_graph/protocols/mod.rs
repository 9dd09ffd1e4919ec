mod binary;
mod constant;
mod iterator;
mod module;
mod sum;

pub use binary::*;
pub use constant::*;
pub use iterator::*;
pub use module::*;
pub use sum::*;

use crate::accum::Bridge;
use crate::intervention_graph::node::Node;
use crate::intervention_graph::{Graph, GraphError};
use crate::value::{ArithmeticOp, Value};
use serde::{Deserialize, Serialize};

/// Operation kinds a node can target. The set is closed; each kind maps to one protocol.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Constant,
    Add,
    Sub,
    Mul,
    Div,
    ModuleInput,
    ModuleOutput,
    Swap,
    IterItem,
    IterSum,
}

impl Target {
    /// Injected nodes get their value from the driver, never from `execute`.
    pub fn is_injected(&self) -> bool {
        matches!(
            self,
            Target::ModuleInput | Target::ModuleOutput | Target::IterItem
        )
    }

    pub fn protocol(&self) -> &'static dyn Protocol {
        match self {
            Target::Constant => &ConstantProtocol,
            Target::Add => &SimpleBinary {
                op: ArithmeticOp::Add,
            },
            Target::Sub => &SimpleBinary {
                op: ArithmeticOp::Sub,
            },
            Target::Mul => &SimpleBinary {
                op: ArithmeticOp::Mul,
            },
            Target::Div => &SimpleBinary {
                op: ArithmeticOp::Div,
            },
            Target::ModuleInput | Target::ModuleOutput => &ModuleActivation,
            Target::Swap => &SwapProtocol,
            Target::IterItem => &IteratorItemProtocol,
            Target::IterSum => &SumProtocol,
        }
    }
}

/// State visible to protocols while a pass runs: the bridge of the enclosing accumulator, if
/// any, and the graphs that nodes of this graph may reference.
#[derive(Clone, Copy, Default)]
pub struct PassContext<'a> {
    bridge: Option<&'a Bridge>,
    parents: &'a [&'a Graph],
}

impl<'a> PassContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bridge(mut self, bridge: &'a Bridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_parents(mut self, parents: &'a [&'a Graph]) -> Self {
        self.parents = parents;
        self
    }

    pub fn bridge(&self) -> Option<&'a Bridge> {
        self.bridge
    }

    pub fn parents(&self) -> &'a [&'a Graph] {
        self.parents
    }
}

pub trait Protocol: Sync {
    fn get_name(&self) -> String;

    /// Computes `node`'s value from the resolved values of its arguments.
    fn execute(
        &self,
        node: &mut Node,
        args: Vec<Value>,
        ctx: &PassContext,
    ) -> Result<(), GraphError>;
}

fn expect_args(node: &Node, args: &[Value], expected: usize) -> Result<(), GraphError> {
    if args.len() != expected {
        return Err(GraphError::ArgumentCount {
            name: node.name().to_string(),
            target: node.target(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}
