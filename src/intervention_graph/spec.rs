use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::protocols::Target;
use crate::intervention_graph::{Graph, GraphError, NodeRef};
use crate::value::{ProxyValue, Value};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSpec {
    Literal(Value),
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub target: Target,
    pub args: Vec<ArgSpec>,
    pub proxy_value: ProxyValue,
    #[serde(default)]
    pub saved: bool,
}

/// Wire form of a graph: node name to node, in insertion order. Values are not included.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphSpec {
    nodes: Vec<(String, NodeSpec)>,
}

impl GraphSpec {
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeSpec)> {
        self.nodes.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, name: impl Into<String>, spec: NodeSpec) {
        self.nodes.push((name.into(), spec));
    }
}

impl Serialize for GraphSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.nodes.len()))?;
        for (name, spec) in &self.nodes {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

struct GraphSpecVisitor;

impl<'de> Visitor<'de> for GraphSpecVisitor {
    type Value = GraphSpec;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of node names to nodes")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<GraphSpec, A::Error> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, spec)) = access.next_entry::<String, NodeSpec>()? {
            if !seen.insert(name.clone()) {
                return Err(serde::de::Error::custom(format!("duplicate node {name}")));
            }
            nodes.push((name, spec));
        }
        Ok(GraphSpec { nodes })
    }
}

impl<'de> Deserialize<'de> for GraphSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(GraphSpecVisitor)
    }
}

impl Graph {
    /// Structural snapshot for shipping to a job service. Only self-contained graphs can be sent.
    pub fn to_spec(&self) -> Result<GraphSpec, GraphError> {
        let mut spec = GraphSpec::default();
        for node in &self.nodes {
            let args = node
                .args()
                .iter()
                .map(|arg| match arg {
                    NodeArg::Literal(v) => Ok(ArgSpec::Literal(v.clone())),
                    NodeArg::Node(r) if r.graph == self.id => Ok(ArgSpec::Node(r.name.clone())),
                    NodeArg::Node(r) => Err(GraphError::ForeignReference {
                        name: node.name().to_string(),
                        dependency: r.name.clone(),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;
            spec.push(
                node.name(),
                NodeSpec {
                    target: node.target(),
                    args,
                    proxy_value: node.proxy_value().clone(),
                    saved: node.is_saved(),
                },
            );
        }
        Ok(spec)
    }

    /// Rebuilds a graph from its wire form and compiles it.
    pub fn from_spec(spec: &GraphSpec) -> Result<Graph, GraphError> {
        let mut graph = Graph::new();
        for (name, node_spec) in spec.nodes() {
            if graph.index.contains_key(name) {
                return Err(GraphError::DuplicateNode(name.to_string()));
            }
            let args = node_spec
                .args
                .iter()
                .map(|arg| match arg {
                    ArgSpec::Literal(v) => NodeArg::Literal(v.clone()),
                    ArgSpec::Node(dep) => NodeArg::Node(NodeRef {
                        graph: graph.id,
                        name: dep.clone(),
                    }),
                })
                .collect();
            let mut node = Node::new(
                name.to_string(),
                node_spec.target,
                args,
                node_spec.proxy_value.clone(),
            );
            if node_spec.saved {
                node.mark_saved();
            }
            graph.insert(node);
        }
        graph.compile()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervention_graph::protocols::{ConstantProtocol, SimpleBinary};
    use crate::value::ArithmeticOp;

    fn wiring(graph: &Graph) -> Vec<(String, Target, Vec<String>)> {
        graph
            .nodes()
            .map(|n| {
                let args = n
                    .args()
                    .iter()
                    .map(|a| match a {
                        NodeArg::Literal(v) => v.to_string(),
                        NodeArg::Node(r) => format!("@{}", r.name()),
                    })
                    .collect();
                (n.name().to_string(), n.target(), args)
            })
            .collect()
    }

    #[test]
    fn test_spec_survives_json_transport() {
        let mut graph = Graph::new();
        let a = ConstantProtocol::add(&mut graph, Value::Int(5));
        let b = SimpleBinary::push_new(&mut graph, ArithmeticOp::Add, &a, Value::Int(3));
        let c = SimpleBinary::push_new(&mut graph, ArithmeticOp::Mul, &b, &a);
        graph.save(&c).unwrap();

        let json = serde_json::to_string(&graph.to_spec().unwrap()).unwrap();
        let received: GraphSpec = serde_json::from_str(&json).unwrap();
        let rebuilt = Graph::from_spec(&received).unwrap();

        assert_eq!(wiring(&rebuilt), wiring(&graph));
        assert!(rebuilt.get(c.name()).unwrap().is_saved());
        assert!(!rebuilt.get(b.name()).unwrap().is_saved());
        assert!(rebuilt.is_compiled());
    }

    #[test]
    fn test_spec_keeps_insertion_order() {
        let mut spec = GraphSpec::default();
        for name in ["zeta", "alpha", "mid"] {
            spec.push(
                name,
                NodeSpec {
                    target: Target::Constant,
                    args: vec![ArgSpec::Literal(Value::Int(1))],
                    proxy_value: ProxyValue::any(),
                    saved: false,
                },
            );
        }
        let json = serde_json::to_string(&spec).unwrap();
        let back: GraphSpec = serde_json::from_str(&json).unwrap();
        let names: Vec<_> = back.nodes().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_duplicate_names_fail_to_deserialize() {
        let json = r#"{
            "a": {"target": "constant", "args": [{"literal": {"int": 1}}],
                  "proxy_value": {"kind": "int"}},
            "a": {"target": "constant", "args": [{"literal": {"int": 2}}],
                  "proxy_value": {"kind": "int"}}
        }"#;
        assert!(serde_json::from_str::<GraphSpec>(json).is_err());
    }

    #[test]
    fn test_cycles_are_rejected_on_rebuild() {
        let mut spec = GraphSpec::default();
        spec.push(
            "a",
            NodeSpec {
                target: Target::Add,
                args: vec![ArgSpec::Node("b".into()), ArgSpec::Literal(Value::Int(1))],
                proxy_value: ProxyValue::any(),
                saved: false,
            },
        );
        spec.push(
            "b",
            NodeSpec {
                target: Target::Add,
                args: vec![ArgSpec::Node("a".into()), ArgSpec::Literal(Value::Int(1))],
                proxy_value: ProxyValue::any(),
                saved: false,
            },
        );
        assert!(matches!(Graph::from_spec(&spec), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_foreign_references_cannot_be_shipped() {
        let mut outer = Graph::new();
        let base = ConstantProtocol::add(&mut outer, Value::Int(1));
        let mut inner = Graph::new();
        SimpleBinary::push_new(&mut inner, ArithmeticOp::Add, &base, Value::Int(1));
        assert!(matches!(
            inner.to_spec(),
            Err(GraphError::ForeignReference { .. })
        ));
    }
}
