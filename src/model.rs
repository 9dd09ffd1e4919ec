use crate::intervention_graph::node::NodeArg;
use crate::intervention_graph::protocols::{HookKind, ModuleActivation, PassContext, Target};
use crate::intervention_graph::{Graph, GraphError};
use crate::value::{ArithmeticOp, Value, ValueError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    ValueError(#[from] ValueError),
    #[error("Graph hooks module {0}, which the model does not have")]
    UnknownModule(String),
    #[error("Invalid model input: {0}")]
    InvalidInput(String),
}

/// A model that runs an intervention graph alongside its own computation.
///
/// Implementations inject activations into `module_input`/`module_output` nodes as they run,
/// execute whatever becomes ready, and continue with any swapped-in replacement.
pub trait InterventionModel {
    fn identifier(&self) -> &str;

    fn forward(
        &self,
        graph: &mut Graph,
        input: &Value,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, ModelError>;

    fn generate(
        &self,
        graph: &mut Graph,
        input: &Value,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineLayer {
    pub name: String,
    pub scale: f32,
    pub bias: f32,
}

impl AffineLayer {
    pub fn new(name: impl Into<String>, scale: f32, bias: f32) -> Self {
        Self {
            name: name.into(),
            scale,
            bias,
        }
    }

    fn apply(&self, x: &Value) -> Result<Value, ValueError> {
        x.apply(ArithmeticOp::Mul, &Value::Float(self.scale as f64))?
            .apply(ArithmeticOp::Add, &Value::Float(self.bias as f64))
    }
}

/// Reference model: a chain of named elementwise affine layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialModel {
    identifier: String,
    layers: Vec<AffineLayer>,
}

impl SequentialModel {
    pub const MAX_NEW_TOKENS: &'static str = "max_new_tokens";

    pub fn new(identifier: impl Into<String>, layers: Vec<AffineLayer>) -> Self {
        Self {
            identifier: identifier.into(),
            layers,
        }
    }

    pub fn layers(&self) -> &[AffineLayer] {
        &self.layers
    }

    fn check_hooks(&self, graph: &Graph) -> Result<(), ModelError> {
        for node in graph.nodes() {
            if !matches!(node.target(), Target::ModuleInput | Target::ModuleOutput) {
                continue;
            }
            match node.args().first() {
                Some(NodeArg::Literal(Value::Str(module)))
                    if self.layers.iter().any(|l| &l.name == module) => {}
                Some(NodeArg::Literal(Value::Str(module))) => {
                    return Err(ModelError::UnknownModule(module.clone()));
                }
                _ => {
                    return Err(GraphError::InvalidArgument {
                        name: node.name().to_string(),
                        reason: "module hooks take the module path as a string literal".to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn run_hooked(&self, graph: &mut Graph, input: &Value) -> Result<Value, ModelError> {
        self.check_hooks(graph)?;
        let ctx = PassContext::new();
        graph.compile()?;
        graph.execute_ready(&ctx, &mut ())?;
        let mut x = input.clone();
        for layer in &self.layers {
            x = ModuleActivation::inject(graph, &layer.name, HookKind::Input, x, &ctx, &mut ())?;
            x = layer.apply(&x)?;
            x = ModuleActivation::inject(graph, &layer.name, HookKind::Output, x, &ctx, &mut ())?;
        }
        graph.execute_ready(&ctx, &mut ())?;
        Ok(x)
    }

    fn run_plain(&self, input: &Value) -> Result<Value, ModelError> {
        let mut x = input.clone();
        for layer in &self.layers {
            x = layer.apply(&x)?;
        }
        Ok(x)
    }
}

impl InterventionModel for SequentialModel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn forward(
        &self,
        graph: &mut Graph,
        input: &Value,
        _args: &[Value],
        _kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, ModelError> {
        self.run_hooked(graph, input)
    }

    /// Runs `max_new_tokens` steps, each fed the previous step's output. Interventions apply
    /// to the first step only.
    fn generate(
        &self,
        graph: &mut Graph,
        input: &Value,
        _args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<Value, ModelError> {
        let steps = match kwargs.get(Self::MAX_NEW_TOKENS) {
            None => 1,
            Some(v) => v.as_i64().filter(|&n| n >= 1).ok_or_else(|| {
                ModelError::InvalidInput(format!(
                    "{} must be a positive integer, got {v}",
                    Self::MAX_NEW_TOKENS
                ))
            })?,
        };
        let mut outputs = vec![self.run_hooked(graph, input)?];
        for _ in 1..steps {
            let next = self.run_plain(&outputs[outputs.len() - 1])?;
            outputs.push(next);
        }
        Ok(Value::List(outputs))
    }
}
