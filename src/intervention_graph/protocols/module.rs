use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::observer::GraphObserver;
use crate::intervention_graph::protocols::{PassContext, Protocol, Target, expect_args};
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ProxyValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Input,
    Output,
}

impl HookKind {
    pub fn target(self) -> Target {
        match self {
            HookKind::Input => Target::ModuleInput,
            HookKind::Output => Target::ModuleOutput,
        }
    }
}

fn hooks_module(node: &Node, module: &str) -> bool {
    matches!(node.args().first(), Some(NodeArg::Literal(Value::Str(m))) if m == module)
}

/// Activation hooks on a model module. The model supplies the value while it runs.
pub struct ModuleActivation;

impl ModuleActivation {
    pub fn add(
        graph: &mut Graph,
        module: &str,
        kind: HookKind,
        proxy_value: ProxyValue,
    ) -> NodeRef {
        graph.create(kind.target(), vec![Value::from(module).into()], proxy_value)
    }

    /// Feeds `activation` into every `kind` hook on `module`, runs whatever became ready and
    /// returns the activation the model should continue with.
    pub fn inject(
        graph: &mut Graph,
        module: &str,
        kind: HookKind,
        activation: Value,
        ctx: &PassContext,
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<Value, GraphError> {
        let hooks: Vec<String> = graph
            .nodes()
            .filter(|n| n.target() == kind.target() && hooks_module(n, module))
            .map(|n| n.name().to_string())
            .collect();
        if hooks.is_empty() {
            return Ok(activation);
        }
        for name in &hooks {
            graph.set_value(name, activation.clone())?;
            observer.on_value_assigned(name, &activation);
        }
        graph.execute_ready(ctx, observer)?;
        let replacement = graph
            .nodes()
            .filter(|n| n.target() == Target::Swap)
            .filter(|n| match n.args().first() {
                Some(NodeArg::Node(r)) => {
                    r.graph() == graph.id() && hooks.iter().any(|h| h == r.name())
                }
                _ => false,
            })
            .filter_map(|n| n.value())
            .last()
            .cloned();
        if replacement.is_some() {
            log::debug!("Swapped {kind:?} activation of {module}");
        }
        Ok(replacement.unwrap_or(activation))
    }
}

impl Protocol for ModuleActivation {
    fn get_name(&self) -> String {
        "ModuleActivation".to_string()
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

/// Replaces a hooked activation: `args = [activation, replacement]`.
pub struct SwapProtocol;

impl SwapProtocol {
    pub fn add(
        graph: &mut Graph,
        activation: &NodeRef,
        replacement: impl Into<NodeArg>,
    ) -> NodeRef {
        let replacement = replacement.into();
        let proxy_value = graph.proxy_of(&replacement);
        graph.create(Target::Swap, vec![activation.into(), replacement], proxy_value)
    }
}

impl Protocol for SwapProtocol {
    fn get_name(&self) -> String {
        "Swap".to_string()
    }

    fn execute(
        &self,
        node: &mut Node,
        mut args: Vec<Value>,
        _ctx: &PassContext,
    ) -> Result<(), GraphError> {
        expect_args(node, &args, 2)?;
        if let Some(replacement) = args.pop() {
            node.set_value(replacement);
        }
        Ok(())
    }
}
