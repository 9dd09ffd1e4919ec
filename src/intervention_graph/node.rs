use crate::intervention_graph::NodeRef;
use crate::intervention_graph::protocols::Target;
use crate::value::{ProxyValue, Value};

/// A single argument of a node: either a literal or a reference to another node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeArg {
    Literal(Value),
    Node(NodeRef),
}

impl From<Value> for NodeArg {
    fn from(value: Value) -> Self {
        NodeArg::Literal(value)
    }
}

impl From<NodeRef> for NodeArg {
    fn from(value: NodeRef) -> Self {
        NodeArg::Node(value)
    }
}

impl From<&NodeRef> for NodeArg {
    fn from(value: &NodeRef) -> Self {
        NodeArg::Node(value.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    target: Target,
    args: Vec<NodeArg>,
    proxy_value: ProxyValue,
    value: Option<Value>,
    done: bool,
    saved: bool,
    pub(crate) executed_pass: Option<u64>,
}

impl Node {
    pub fn new(name: String, target: Target, args: Vec<NodeArg>, proxy_value: ProxyValue) -> Self {
        Self {
            name,
            target,
            args,
            proxy_value,
            value: None,
            done: false,
            saved: false,
            executed_pass: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn args(&self) -> &[NodeArg] {
        &self.args
    }

    pub fn proxy_value(&self) -> &ProxyValue {
        &self.proxy_value
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub(crate) fn mark_saved(&mut self) {
        self.saved = true;
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// The externally visible value. Absent until the node is done.
    pub fn value(&self) -> Option<&Value> {
        if self.done { self.value.as_ref() } else { None }
    }

    /// The value slot regardless of the done flag, e.g. a running total that has not been released.
    pub(crate) fn partial_value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
        self.done = true;
    }

    /// Writes the value slot without publishing it.
    pub(crate) fn store(&mut self, value: Value) {
        self.value = Some(value);
    }

    /// Clears the done flag so the node runs again next pass. The value slot is kept.
    pub fn reset(&mut self) {
        self.done = false;
    }

    pub(crate) fn clear(&mut self) {
        self.value = None;
        self.done = false;
        self.executed_pass = None;
    }

    /// Names of same-graph nodes this node reads from.
    pub(crate) fn local_dependencies<'a>(
        &'a self,
        graph: crate::intervention_graph::GraphId,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.args.iter().filter_map(move |arg| match arg {
            NodeArg::Node(r) if r.graph == graph => Some(r.name.as_str()),
            _ => None,
        })
    }
}
