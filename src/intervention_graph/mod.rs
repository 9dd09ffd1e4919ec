use crate::intervention_graph::attachments::Attachments;
use crate::intervention_graph::node::{Node, NodeArg};
use crate::intervention_graph::observer::GraphObserver;
use crate::intervention_graph::protocols::{PassContext, Target};
use crate::value::{ProxyValue, Value, ValueError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

pub mod attachments;
pub mod node;
pub mod observer;
pub mod protocols;
mod spec;

pub use spec::{ArgSpec, GraphSpec, NodeSpec};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Node {0} does not exist")]
    MissingNode(String),
    #[error("Node {name} depends on {dependency}, which is not done")]
    UnsatisfiedDependency { name: String, dependency: String },
    #[error("Node {0} already exists")]
    DuplicateNode(String),
    #[error("Graph contains a cycle through {0:?}")]
    Cycle(Vec<String>),
    #[error("Node {name} references a node in unknown graph {graph}")]
    UnknownGraph { name: String, graph: GraphId },
    #[error("Node {name} references {dependency} outside its own graph")]
    ForeignReference { name: String, dependency: String },
    #[error("Node {name} ({target}) expects {expected} arguments, got {got}")]
    ArgumentCount {
        name: String,
        target: Target,
        expected: usize,
        got: usize,
    },
    #[error("Invalid argument for node {name}: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("Node {0} accumulates across passes but no bridge is attached")]
    MissingBridge(String),
    #[error("Node {0} receives its value from the driver and cannot be executed")]
    NotExecutable(String),
    #[error("Error evaluating node {name}: {source}")]
    Evaluation {
        name: String,
        #[source]
        source: ValueError,
    },
}

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct GraphId(u32);

impl GraphId {
    fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph#{}", self.0)
    }
}

/// Handle to a node: the owning graph plus the node's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub(crate) graph: GraphId,
    pub(crate) name: String,
}

impl NodeRef {
    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

enum Resolution {
    Ready(Vec<Value>),
    Blocked(String),
}

#[derive(Debug, Clone)]
pub struct Graph {
    id: GraphId,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    attachments: Attachments,
    order: Option<Vec<usize>>,
    pass: u64,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            id: GraphId::next(),
            nodes: vec![],
            index: HashMap::new(),
            attachments: Attachments::new(),
            order: None,
            pass: 0,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.index.get(name).map(|&i| &mut self.nodes[i])
    }

    pub fn node_ref(&self, name: &str) -> Result<NodeRef, GraphError> {
        if self.index.contains_key(name) {
            Ok(NodeRef {
                graph: self.id,
                name: name.to_string(),
            })
        } else {
            Err(GraphError::MissingNode(name.to_string()))
        }
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    /// Adds a node under a generated name `{target}_{n}`, with `n` counted per target.
    pub fn create(
        &mut self,
        target: Target,
        args: Vec<NodeArg>,
        proxy_value: ProxyValue,
    ) -> NodeRef {
        let key = format!("node.{target}");
        let name = loop {
            let name = format!("{target}_{}", self.attachments.next_index(&key));
            if !self.index.contains_key(&name) {
                break name;
            }
        };
        self.insert(Node::new(name, target, args, proxy_value))
    }

    pub fn create_named(
        &mut self,
        name: impl Into<String>,
        target: Target,
        args: Vec<NodeArg>,
        proxy_value: ProxyValue,
    ) -> Result<NodeRef, GraphError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateNode(name));
        }
        for arg in &args {
            if let NodeArg::Node(r) = arg {
                if r.graph == self.id && !self.index.contains_key(&r.name) {
                    return Err(GraphError::MissingNode(r.name.clone()));
                }
            }
        }
        Ok(self.insert(Node::new(name, target, args, proxy_value)))
    }

    fn insert(&mut self, node: Node) -> NodeRef {
        let name = node.name().to_string();
        self.index.insert(name.clone(), self.nodes.len());
        self.nodes.push(node);
        self.order = None;
        NodeRef {
            graph: self.id,
            name,
        }
    }

    /// Best known placeholder for an argument, used when building new nodes.
    pub fn proxy_of(&self, arg: &NodeArg) -> ProxyValue {
        match arg {
            NodeArg::Literal(v) => ProxyValue::of(v),
            NodeArg::Node(r) if r.graph == self.id => self
                .get(&r.name)
                .map(|n| n.proxy_value().clone())
                .unwrap_or_default(),
            NodeArg::Node(_) => ProxyValue::any(),
        }
    }

    /// Marks a node for retention so its value is returned from remote execution.
    pub fn save(&mut self, node: &NodeRef) -> Result<(), GraphError> {
        if node.graph != self.id {
            return Err(GraphError::UnknownGraph {
                name: node.name.clone(),
                graph: node.graph,
            });
        }
        self.get_mut(&node.name)
            .ok_or_else(|| GraphError::MissingNode(node.name.clone()))?
            .mark_saved();
        Ok(())
    }

    pub fn saved_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_saved())
    }

    /// Values of every saved node that is done.
    pub fn saves(&self) -> BTreeMap<String, Value> {
        self.saved_nodes()
            .filter_map(|n| n.value().map(|v| (n.name().to_string(), v.clone())))
            .collect()
    }

    pub fn value(&self, node: &NodeRef) -> Option<&Value> {
        if node.graph != self.id {
            return None;
        }
        self.get(&node.name).and_then(|n| n.value())
    }

    /// Writes a value supplied from outside the graph, marking the node done.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<(), GraphError> {
        let pass = self.pass;
        let node = self
            .get_mut(name)
            .ok_or_else(|| GraphError::MissingNode(name.to_string()))?;
        node.set_value(value);
        node.executed_pass = Some(pass);
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.order.is_some()
    }

    /// Validates references and fixes a dependency order. Does nothing if already compiled.
    pub fn compile(&mut self) -> Result<(), GraphError> {
        if self.order.is_some() {
            return Ok(());
        }
        let mut indegree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in node.local_dependencies(self.id) {
                let j = *self
                    .index
                    .get(dep)
                    .ok_or_else(|| GraphError::MissingNode(dep.to_string()))?;
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].name().to_string())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        log::debug!("Compiled {} with {} nodes", self.id, order.len());
        self.order = Some(order);
        Ok(())
    }

    /// Names of `name` and every node that transitively reads from it.
    pub fn downstream_of(&self, name: &str) -> Result<HashSet<String>, GraphError> {
        self.downstream_of_all([name])
    }

    /// Names of every seed and every node that transitively reads from one of them.
    pub fn downstream_of_all<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashSet<String>, GraphError> {
        let mut reached = HashSet::new();
        for seed in seeds {
            if !self.index.contains_key(seed) {
                return Err(GraphError::MissingNode(seed.to_string()));
            }
            reached.insert(seed.to_string());
        }
        let mut changed = true;
        while changed {
            changed = false;
            for node in &self.nodes {
                if reached.contains(node.name()) {
                    continue;
                }
                if node.local_dependencies(self.id).any(|d| reached.contains(d)) {
                    reached.insert(node.name().to_string());
                    changed = true;
                }
            }
        }
        Ok(reached)
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Starts a new pass. Nodes executed in earlier passes may run again once reset.
    pub fn next_pass(&mut self) -> u64 {
        self.pass += 1;
        self.pass
    }

    pub fn reset_nodes<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            if let Some(&i) = self.index.get(name.as_str()) {
                self.nodes[i].reset();
            }
        }
    }

    pub fn clear_nodes<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            if let Some(&i) = self.index.get(name.as_str()) {
                self.nodes[i].clear();
            }
        }
    }

    /// Starts a fresh round: every node loses its value and the pass counter restarts.
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            node.clear();
        }
        self.pass = 0;
    }

    fn resolve_args(&self, idx: usize, ctx: &PassContext) -> Result<Resolution, GraphError> {
        let node = &self.nodes[idx];
        let mut values = Vec::with_capacity(node.args().len());
        for arg in node.args() {
            match arg {
                NodeArg::Literal(v) => values.push(v.clone()),
                NodeArg::Node(r) => {
                    let dep = if r.graph == self.id {
                        self.get(&r.name)
                    } else {
                        let parent = ctx
                            .parents()
                            .iter()
                            .find(|g| g.id == r.graph)
                            .ok_or_else(|| GraphError::UnknownGraph {
                                name: node.name().to_string(),
                                graph: r.graph,
                            })?;
                        parent.get(&r.name)
                    }
                    .ok_or_else(|| GraphError::MissingNode(r.name.clone()))?;
                    match dep.value() {
                        Some(v) => values.push(v.clone()),
                        None => return Ok(Resolution::Blocked(r.name.clone())),
                    }
                }
            }
        }
        Ok(Resolution::Ready(values))
    }

    fn run_node(
        &mut self,
        idx: usize,
        args: Vec<Value>,
        ctx: &PassContext,
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<(), GraphError> {
        let pass = self.pass;
        let node = &mut self.nodes[idx];
        let start_instant = Instant::now();
        node.target().protocol().execute(node, args, ctx)?;
        node.executed_pass = Some(pass);
        let end_instant = Instant::now();
        observer.on_node_executed(node.name(), start_instant, end_instant);
        if let Some(value) = node.value() {
            observer.on_value_assigned(node.name(), value);
        }
        Ok(())
    }

    /// Executes a single node. Every argument must already be done.
    pub fn execute_node(
        &mut self,
        name: &str,
        ctx: &PassContext,
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<(), GraphError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| GraphError::MissingNode(name.to_string()))?;
        if self.nodes[idx].target().is_injected() {
            return Err(GraphError::NotExecutable(name.to_string()));
        }
        match self.resolve_args(idx, ctx)? {
            Resolution::Ready(args) => self.run_node(idx, args, ctx, observer),
            Resolution::Blocked(dependency) => Err(GraphError::UnsatisfiedDependency {
                name: name.to_string(),
                dependency,
            }),
        }
    }

    /// Executes, in dependency order, every outstanding node whose arguments are done.
    /// A node runs at most once per pass. Returns how many nodes ran.
    pub fn execute_ready(
        &mut self,
        ctx: &PassContext,
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<usize, GraphError> {
        self.compile()?;
        let order = self.order.clone().unwrap_or_default();
        let mut executed = 0;
        for idx in order {
            let node = &self.nodes[idx];
            if node.done()
                || node.target().is_injected()
                || node.executed_pass == Some(self.pass)
            {
                continue;
            }
            if let Resolution::Ready(args) = self.resolve_args(idx, ctx)? {
                self.run_node(idx, args, ctx, observer)?;
                executed += 1;
            }
        }
        Ok(executed)
    }

    /// Like `execute_ready`, then fails if any executable node is still outstanding.
    pub fn execute_all(
        &mut self,
        ctx: &PassContext,
        observer: &mut (impl GraphObserver + ?Sized),
    ) -> Result<(), GraphError> {
        self.execute_ready(ctx, observer)?;
        for idx in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if node.done() || node.executed_pass == Some(self.pass) {
                continue;
            }
            if let Resolution::Blocked(dependency) = self.resolve_args(idx, ctx)? {
                return Err(GraphError::UnsatisfiedDependency {
                    name: node.name().to_string(),
                    dependency,
                });
            }
        }
        Ok(())
    }
}
