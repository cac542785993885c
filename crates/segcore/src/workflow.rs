use crate::{Operation, PortDirection, Value, WorkflowError};
use petgraph::algo::is_cyclic_directed;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Position of a node in its graph's declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Invoked once per instance
    Scalar,
    /// Invoked once per element of the list-typed `iterfield` inputs
    Map { iterfield: BTreeSet<String> },
}

/// Node declaration: an operation plus its literal parameters
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    pub operation: Arc<dyn Operation>,
    pub params: BTreeMap<String, Value>,
    pub kind: NodeKind,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            operation,
            params: BTreeMap::new(),
            kind: NodeKind::Scalar,
        }
    }

    pub fn map<I, S>(name: impl Into<String>, operation: Arc<dyn Operation>, iterfield: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: NodeKind::Map {
                iterfield: iterfield.into_iter().map(Into::into).collect(),
            },
            ..Self::new(name, operation)
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn operation_type(&self) -> &str {
        self.operation.operation_type()
    }

    pub fn iterfield(&self) -> Option<&BTreeSet<String>> {
        match &self.kind {
            NodeKind::Map { iterfield } => Some(iterfield),
            NodeKind::Scalar => None,
        }
    }

    fn input_port(&self, port: &str) -> Result<(), WorkflowError> {
        if self.operation.signature().has_input(port) {
            Ok(())
        } else {
            Err(self.port_error(port, PortDirection::Input))
        }
    }

    fn output_port(&self, port: &str) -> Result<(), WorkflowError> {
        if self.operation.signature().has_output(port) {
            Ok(())
        } else {
            Err(self.port_error(port, PortDirection::Output))
        }
    }

    fn port_error(&self, port: &str, direction: PortDirection) -> WorkflowError {
        WorkflowError::Port {
            node: self.name.clone(),
            port: port.to_string(),
            direction,
        }
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("operation", &self.operation_type())
            .field("params", &self.params)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Connection between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

/// A set of values one input port is iterated over
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iterable {
    pub node: NodeId,
    pub port: String,
    pub values: Vec<Value>,
}

/// Complete workflow definition
pub struct WorkflowGraph {
    name: String,
    base_dir: PathBuf,
    nodes: Vec<NodeSpec>,
    names: HashMap<String, NodeId>,
    connections: Vec<Connection>,
    iterables: Vec<Iterable>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            nodes: Vec::new(),
            names: HashMap::new(),
            connections: Vec::new(),
            iterables: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Root of all node working directories: `<base_dir>/<name>`
    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join(&self.name)
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn iterables(&self) -> &[Iterable] {
        &self.iterables
    }

    pub fn add_node(&mut self, node: NodeSpec) -> Result<NodeId, WorkflowError> {
        if self.names.contains_key(&node.name) {
            return Err(WorkflowError::DuplicateNode(node.name));
        }
        for port in node.params.keys() {
            node.input_port(port)?;
        }
        if let Some(iterfield) = node.iterfield() {
            if iterfield.is_empty() {
                return Err(WorkflowError::Invalid(format!(
                    "map node '{}' declares no iterfield",
                    node.name
                )));
            }
            for port in iterfield {
                node.input_port(port)?;
            }
        }

        let id = NodeId(self.nodes.len());
        self.names.insert(node.name.clone(), id);
        self.nodes.push(node);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeSpec, WorkflowError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| WorkflowError::NodeNotFound(format!("#{}", id.0)))
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Bind a literal value to an input port. Rebinding a literal replaces
    /// it; binding a port that is connected or iterated is a conflict.
    pub fn bind_param(
        &mut self,
        node: NodeId,
        port: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), WorkflowError> {
        let port = port.into();
        self.node(node)?.input_port(&port)?;
        if self.is_connected(node, &port) || self.is_iterated(node, &port) {
            return Err(self.conflict(node, &port));
        }
        self.nodes[node.0].params.insert(port, value.into());
        Ok(())
    }

    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: impl Into<String>,
        to_node: NodeId,
        to_port: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let from_port = from_port.into();
        let to_port = to_port.into();
        self.node(from_node)?.output_port(&from_port)?;
        let target = self.node(to_node)?;
        target.input_port(&to_port)?;

        if target.params.contains_key(&to_port)
            || self.is_connected(to_node, &to_port)
            || self.is_iterated(to_node, &to_port)
        {
            return Err(self.conflict(to_node, &to_port));
        }

        self.connections.push(Connection {
            from_node,
            from_port,
            to_node,
            to_port,
        });
        Ok(())
    }

    /// Connect several port pairs between the same two nodes.
    pub fn connect_ports(
        &mut self,
        from_node: NodeId,
        to_node: NodeId,
        ports: &[(&str, &str)],
    ) -> Result<(), WorkflowError> {
        for (from_port, to_port) in ports {
            self.connect(from_node, *from_port, to_node, *to_port)?;
        }
        Ok(())
    }

    /// Instantiate the downstream closure of `node` once per value.
    pub fn declare_iterable(
        &mut self,
        node: NodeId,
        port: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), WorkflowError> {
        let port = port.into();
        let spec = self.node(node)?;
        spec.input_port(&port)?;

        let invalid = |reason: &str| WorkflowError::InvalidIterable {
            node: spec.name.clone(),
            reason: reason.to_string(),
        };
        if values.is_empty() {
            return Err(invalid("no values"));
        }
        if self.iterables.iter().any(|it| it.node == node) {
            return Err(invalid("node already has an iterable"));
        }
        if spec.params.contains_key(&port) || self.is_connected(node, &port) {
            return Err(self.conflict(node, &port));
        }

        self.iterables.push(Iterable { node, port, values });
        Ok(())
    }

    /// Connections arriving at `node`, in declaration order.
    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.to_node == node)
    }

    fn is_connected(&self, node: NodeId, port: &str) -> bool {
        self.incoming(node).any(|c| c.to_port == port)
    }

    fn is_iterated(&self, node: NodeId, port: &str) -> bool {
        self.iterables.iter().any(|it| it.node == node && it.port == port)
    }

    fn conflict(&self, node: NodeId, port: &str) -> WorkflowError {
        WorkflowError::PortConflict {
            node: self.nodes[node.0].name.clone(),
            port: port.to_string(),
        }
    }

    /// Check the graph and resolve its execution order.
    ///
    /// Fails on cycles and on required inputs that have no binding. The
    /// order is topological with ties broken by declaration order.
    pub fn validate(&self) -> Result<ExecutionPlan, WorkflowError> {
        let mut graph = DiGraph::<NodeId, ()>::with_capacity(self.nodes.len(), self.connections.len());
        let indices: Vec<_> = (0..self.nodes.len()).map(|i| graph.add_node(NodeId(i))).collect();
        for conn in &self.connections {
            graph.update_edge(indices[conn.from_node.0], indices[conn.to_node.0], ());
        }
        if is_cyclic_directed(&graph) {
            return Err(WorkflowError::CyclicDependency);
        }

        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId(i);
            for port in &node.operation.signature().inputs {
                let bound = !port.required
                    || port.default.is_some()
                    || node.params.contains_key(&port.name)
                    || self.is_connected(id, &port.name)
                    || self.is_iterated(id, &port.name);
                if !bound {
                    return Err(WorkflowError::UnboundInput {
                        node: node.name.clone(),
                        port: port.name.clone(),
                    });
                }
            }
        }

        let upstream: Vec<Vec<NodeId>> = indices
            .iter()
            .map(|&idx| {
                let mut deps: Vec<NodeId> = graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .map(|dep| graph[dep])
                    .collect();
                deps.sort();
                deps.dedup();
                deps
            })
            .collect();

        let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeId(i));
            for (j, deps) in upstream.iter().enumerate() {
                if deps.contains(&NodeId(i)) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.push(Reverse(j));
                    }
                }
            }
        }

        let mut iteration_sources: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for &id in &order {
            let mut sources: BTreeSet<usize> = self
                .iterables
                .iter()
                .enumerate()
                .filter(|(_, it)| it.node == id)
                .map(|(k, _)| k)
                .collect();
            for dep in &upstream[id.0] {
                sources.extend(iteration_sources[dep.0].iter().copied());
            }
            iteration_sources[id.0] = sources;
        }

        Ok(ExecutionPlan {
            order,
            upstream,
            iteration_sources: iteration_sources
                .into_iter()
                .map(|s| s.into_iter().collect())
                .collect(),
        })
    }

    /// Graphviz rendering of nodes and port connections.
    pub fn to_dot(&self) -> String {
        let mut graph = DiGraph::<String, String>::new();
        let indices: Vec<_> = self
            .nodes
            .iter()
            .map(|node| {
                let label = match node.iterfield() {
                    Some(fields) => format!(
                        "{} ({}) map[{}]",
                        node.name,
                        node.operation_type(),
                        fields.iter().cloned().collect::<Vec<_>>().join(",")
                    ),
                    None => format!("{} ({})", node.name, node.operation_type()),
                };
                graph.add_node(label)
            })
            .collect();
        for conn in &self.connections {
            graph.add_edge(
                indices[conn.from_node.0],
                indices[conn.to_node.0],
                format!("{} -> {}", conn.from_port, conn.to_port),
            );
        }
        format!("{}", Dot::with_config(&graph, &[Config::GraphContentOnly]))
            .lines()
            .fold(format!("digraph {} {{\n", self.name), |mut out, line| {
                out.push_str(line);
                out.push('\n');
                out
            })
            + "}\n"
    }

    /// Write `graph.dot` into the workflow's working directory.
    pub fn write_graph(&self) -> std::io::Result<PathBuf> {
        let dir = self.work_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("graph.dot");
        std::fs::write(&path, self.to_dot())?;
        tracing::info!("Wrote workflow graph to {}", path.display());
        Ok(path)
    }
}

/// Resolved, validated execution order of a graph
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<NodeId>,
    upstream: Vec<Vec<NodeId>>,
    iteration_sources: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes with an edge into `node`, sorted and deduplicated.
    pub fn upstream(&self, node: NodeId) -> &[NodeId] {
        &self.upstream[node.0]
    }

    /// Indices into [`WorkflowGraph::iterables`] that expand `node`: its own
    /// iterable plus every iterable upstream of it.
    pub fn iteration_sources(&self, node: NodeId) -> &[usize] {
        &self.iteration_sources[node.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeError, OperationContext, OperationOutput, PortDefinition, Signature};
    use async_trait::async_trait;

    struct Stub {
        signature: Signature,
    }

    impl Stub {
        fn new() -> Arc<dyn Operation> {
            Arc::new(Self {
                signature: Signature::new()
                    .input(PortDefinition::required("in_file"))
                    .input(PortDefinition::optional("frac").with_default(0.5))
                    .output(PortDefinition::output("out_file")),
            })
        }
    }

    #[async_trait]
    impl Operation for Stub {
        fn operation_type(&self) -> &str {
            "test.stub"
        }

        fn signature(&self) -> &Signature {
            &self.signature
        }

        async fn invoke(&self, _ctx: OperationContext) -> Result<OperationOutput, NodeError> {
            Ok(OperationOutput::new())
        }
    }

    fn chain(names: &[&str]) -> (WorkflowGraph, Vec<NodeId>) {
        let mut graph = WorkflowGraph::new("test", "/tmp/seg");
        let ids: Vec<NodeId> = names
            .iter()
            .map(|n| graph.add_node(NodeSpec::new(*n, Stub::new())).unwrap())
            .collect();
        graph.bind_param(ids[0], "in_file", "/data/t1.nii.gz").unwrap();
        for pair in ids.windows(2) {
            graph.connect(pair[0], "out_file", pair[1], "in_file").unwrap();
        }
        (graph, ids)
    }

    #[test]
    fn rejects_unknown_ports() {
        let (mut graph, ids) = chain(&["a", "b"]);
        let err = graph.connect(ids[0], "missing", ids[1], "in_file").unwrap_err();
        assert!(matches!(err, WorkflowError::Port { direction: PortDirection::Output, .. }));

        let err = graph.connect(ids[0], "out_file", ids[1], "nope").unwrap_err();
        assert!(matches!(err, WorkflowError::Port { direction: PortDirection::Input, .. }));
    }

    #[test]
    fn second_binding_to_an_input_is_a_conflict() {
        let (mut graph, ids) = chain(&["a", "b", "c"]);
        let err = graph.connect(ids[0], "out_file", ids[2], "in_file").unwrap_err();
        assert_eq!(
            err,
            WorkflowError::PortConflict {
                node: "c".to_string(),
                port: "in_file".to_string()
            }
        );

        let err = graph.bind_param(ids[1], "in_file", "/x.nii.gz").unwrap_err();
        assert!(matches!(err, WorkflowError::PortConflict { .. }));

        let err = graph.connect(ids[1], "out_file", ids[0], "in_file").unwrap_err();
        assert!(matches!(err, WorkflowError::PortConflict { .. }));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (mut graph, _) = chain(&["a"]);
        let err = graph.add_node(NodeSpec::new("a", Stub::new())).unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateNode("a".to_string()));
    }

    #[test]
    fn cycles_fail_validation() {
        let mut graph = WorkflowGraph::new("test", "/tmp/seg");
        let a = graph.add_node(NodeSpec::new("a", Stub::new())).unwrap();
        let b = graph.add_node(NodeSpec::new("b", Stub::new())).unwrap();
        graph.connect(a, "out_file", b, "in_file").unwrap();
        graph.connect(b, "out_file", a, "in_file").unwrap();

        assert_eq!(graph.validate().unwrap_err(), WorkflowError::CyclicDependency);
    }

    #[test]
    fn unbound_required_input_fails_validation() {
        let mut graph = WorkflowGraph::new("test", "/tmp/seg");
        graph.add_node(NodeSpec::new("lonely", Stub::new())).unwrap();

        assert!(matches!(
            graph.validate().unwrap_err(),
            WorkflowError::UnboundInput { ref port, .. } if port == "in_file"
        ));
    }

    #[test]
    fn order_respects_edges_and_declaration_order() {
        let mut graph = WorkflowGraph::new("test", "/tmp/seg");
        let late = graph.add_node(NodeSpec::new("late", Stub::new())).unwrap();
        let root = graph
            .add_node(NodeSpec::new("root", Stub::new()).with_param("in_file", "/t1"))
            .unwrap();
        let other = graph
            .add_node(NodeSpec::new("other", Stub::new()).with_param("in_file", "/t2"))
            .unwrap();
        graph.connect(root, "out_file", late, "in_file").unwrap();

        let plan = graph.validate().unwrap();
        assert_eq!(plan.order(), &[root, late, other]);
        assert_eq!(plan.upstream(late), &[root]);
    }

    #[test]
    fn iteration_sources_flow_downstream() {
        let (mut graph, ids) = chain(&["a", "b"]);
        let lone = graph
            .add_node(NodeSpec::new("lone", Stub::new()).with_param("in_file", "/t"))
            .unwrap();
        graph.nodes[ids[0].0].params.remove("in_file");
        graph
            .declare_iterable(ids[0], "in_file", vec!["/s1".into(), "/s2".into()])
            .unwrap();

        let plan = graph.validate().unwrap();
        assert_eq!(plan.iteration_sources(ids[0]), &[0]);
        assert_eq!(plan.iteration_sources(ids[1]), &[0]);
        assert!(plan.iteration_sources(lone).is_empty());
    }

    #[test]
    fn iterable_needs_values() {
        let (mut graph, ids) = chain(&["a", "b"]);
        let err = graph.declare_iterable(ids[1], "frac", vec![]).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidIterable { .. }));
    }

    #[test]
    fn dot_export_lists_nodes_and_ports() {
        let (graph, _) = chain(&["cropT1", "betT1"]);
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph test {"));
        assert!(dot.contains("cropT1 (test.stub)"));
        assert!(dot.contains("out_file -> in_file"));
    }

    #[test]
    fn write_graph_creates_file_under_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = WorkflowGraph::new("SegT1", dir.path());
        graph
            .add_node(NodeSpec::new("a", Stub::new()).with_param("in_file", "/t"))
            .unwrap();

        let path = graph.write_graph().unwrap();
        assert_eq!(path, dir.path().join("SegT1").join("graph.dot"));
        assert!(path.exists());
    }
}
