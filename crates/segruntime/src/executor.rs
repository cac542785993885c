use crate::cache::{file_digests, CacheKey, CacheOutcome, ResultCache};
use chrono::Utc;
use futures::stream::{self, FuturesUnordered, StreamExt, TryStreamExt};
use segcore::{
    EventBus, EventEmitter, ExecutionEvent, ExecutionId, ExecutionPlan, FlowError, NodeError,
    NodeId, NodeKind, Operation, OperationContext, Value, WorkflowError, WorkflowGraph,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Pending,
    Resolving,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Executes workflow graphs, expanding iterables and map nodes
pub struct WorkflowExecutor {
    max_parallel: usize,
    cache: Arc<ResultCache>,
}

/// (iterable index, value index) pairs, ordered by iterable index
type IterationKey = Vec<(usize, usize)>;

struct NodeInstance {
    node: NodeId,
    key: IterationKey,
    label: String,
    iteration: Vec<(String, Value)>,
    work_dir: PathBuf,
    deps: Vec<usize>,
    state: InstanceState,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    cached: bool,
    error: Option<NodeError>,
    duration_ms: u64,
}

impl WorkflowExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self::with_cache(max_parallel, Arc::new(ResultCache::new()))
    }

    pub fn with_cache(max_parallel: usize, cache: Arc<ResultCache>) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            cache,
        }
    }

    /// Execute a workflow graph and report every node instance
    ///
    /// Configuration errors are returned before anything runs. Node
    /// failures do not make this return `Err`; they are reported per
    /// instance and their dependents are skipped.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        event_bus: &EventBus,
    ) -> Result<ExecutionResult, FlowError> {
        self.execute_with_cancellation(graph, event_bus, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), but stops starting new instances
    /// once `cancel` fires. Running operations are left to finish.
    pub async fn execute_with_cancellation(
        &self,
        graph: &WorkflowGraph,
        event_bus: &EventBus,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        let plan = graph.validate()?;
        let mut arena = instantiate(graph, &plan)?;

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow: graph.name().to_string(),
            instances: arena.len(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Starting workflow '{}' with {} node instances",
            graph.name(),
            arena.len()
        );

        // Shared by scalar instances and map elements, so at most
        // `max_parallel` operations run at once.
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut running = FuturesUnordered::new();

        loop {
            let mut changed = false;
            let mut ready = Vec::new();

            // Arena order is topological, so skips propagate in one pass.
            for i in 0..arena.len() {
                if arena[i].state != InstanceState::Pending {
                    continue;
                }
                let reason = if cancel.is_cancelled() {
                    Some("execution cancelled".to_string())
                } else {
                    blocked_by(graph, &arena, i)
                };
                if let Some(reason) = reason {
                    skip(graph, &mut arena[i], &reason, event_bus, execution_id);
                    changed = true;
                } else if arena[i]
                    .deps
                    .iter()
                    .all(|&d| arena[d].state == InstanceState::Succeeded)
                {
                    ready.push(i);
                }
            }

            for i in ready {
                if running.len() >= self.max_parallel {
                    break;
                }
                changed = true;
                let spec = &graph.nodes()[arena[i].node.index()];

                arena[i].state = InstanceState::Resolving;
                let inputs = match resolve_inputs(graph, &arena, i) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        fail(graph, &mut arena[i], e, 0, event_bus, execution_id);
                        continue;
                    }
                };
                arena[i].inputs = inputs.clone();
                arena[i].state = InstanceState::Running;

                let instance = &arena[i];
                event_bus.emit(ExecutionEvent::NodeStarted {
                    execution_id,
                    node: spec.name.clone(),
                    instance: instance.label.clone(),
                    operation: spec.operation_type().to_string(),
                    timestamp: Utc::now(),
                });
                tracing::debug!("Starting {}{}", spec.name, instance.label);

                let job = Job {
                    operation: Arc::clone(&spec.operation),
                    kind: spec.kind.clone(),
                    node_name: spec.name.clone(),
                    label: instance.label.clone(),
                    iteration: instance.iteration.clone(),
                    work_dir: instance.work_dir.clone(),
                    inputs,
                    cache: Arc::clone(&self.cache),
                    events: event_bus.create_emitter(execution_id, &spec.name, &instance.label),
                    map_parallel: self.max_parallel,
                    permits: Arc::clone(&permits),
                };
                let started = Instant::now();
                let handle = tokio::spawn(job.run());
                running.push(async move {
                    let joined = handle.await;
                    (i, joined, started.elapsed().as_millis() as u64)
                });
            }

            // If nothing is running and nothing changed, we're done
            if running.is_empty() {
                if changed {
                    continue;
                }
                break;
            }

            // Wait for next task to complete
            if let Some((i, joined, duration_ms)) = running.next().await {
                match joined {
                    Ok(Ok(outcome)) => {
                        succeed(graph, &mut arena[i], outcome, duration_ms, event_bus, execution_id)
                    }
                    Ok(Err(e)) => fail(graph, &mut arena[i], e, duration_ms, event_bus, execution_id),
                    Err(join_error) => {
                        let operation = graph.nodes()[arena[i].node.index()].operation_type();
                        let error =
                            NodeError::operation_failed(operation, None, join_failure(join_error));
                        fail(graph, &mut arena[i], error, duration_ms, event_bus, execution_id)
                    }
                }
            }
        }

        // Unreachable for a validated graph; keeps the report total.
        for instance in arena.iter_mut().filter(|inst| !inst.state.is_terminal()) {
            instance.state = InstanceState::Skipped;
        }

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let result = ExecutionResult {
            execution_id,
            workflow: graph.name().to_string(),
            duration_ms,
            instances: arena
                .into_iter()
                .map(|inst| InstanceReport {
                    node: graph.nodes()[inst.node.index()].name.clone(),
                    node_id: inst.node,
                    label: inst.label,
                    iteration: inst.iteration,
                    state: inst.state,
                    work_dir: inst.work_dir,
                    inputs: inst.inputs,
                    outputs: inst.outputs,
                    cached: inst.cached,
                    error: inst.error,
                    duration_ms: inst.duration_ms,
                })
                .collect(),
        };

        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            success: result.is_success(),
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            "Workflow '{}' finished in {}ms: {} succeeded, {} failed, {} skipped",
            graph.name(),
            duration_ms,
            result.count(InstanceState::Succeeded),
            result.count(InstanceState::Failed),
            result.count(InstanceState::Skipped)
        );

        Ok(result)
    }
}

/// Build one instance per node and combination of upstream iterable values.
fn instantiate(graph: &WorkflowGraph, plan: &ExecutionPlan) -> Result<Vec<NodeInstance>, FlowError> {
    let mut arena: Vec<NodeInstance> = Vec::new();
    let mut index: HashMap<(NodeId, IterationKey), usize> = HashMap::new();
    let labels = iterable_labels(graph)?;

    for &node in plan.order() {
        let spec = &graph.nodes()[node.index()];
        for key in combinations(graph, plan.iteration_sources(node)) {
            let deps = plan
                .upstream(node)
                .iter()
                .map(|&up| {
                    let up_key = restrict(&key, plan.iteration_sources(up));
                    index.get(&(up, up_key)).copied().ok_or_else(|| {
                        FlowError::Execution(format!("no upstream instance for '{}'", spec.name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let iteration: Vec<(String, Value)> = key
                .iter()
                .map(|&(it, v)| {
                    let iterable = &graph.iterables()[it];
                    (iterable.port.clone(), iterable.values[v].clone())
                })
                .collect();
            let label: String = key
                .iter()
                .map(|&(it, v)| format!("_{}_{}", graph.iterables()[it].port, labels[it][v]))
                .collect();

            let mut work_dir = graph.work_dir();
            if !label.is_empty() {
                work_dir.push(&label);
            }
            work_dir.push(&spec.name);

            index.insert((node, key.clone()), arena.len());
            arena.push(NodeInstance {
                node,
                key,
                label,
                iteration,
                work_dir,
                deps,
                state: InstanceState::Pending,
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                cached: false,
                error: None,
                duration_ms: 0,
            });
        }
    }

    Ok(arena)
}

/// Directory labels for every iterable value, distinct within each iterable.
fn iterable_labels(graph: &WorkflowGraph) -> Result<Vec<Vec<String>>, WorkflowError> {
    graph
        .iterables()
        .iter()
        .map(|iterable| {
            let labels: Vec<String> = iterable.values.iter().map(value_label).collect();
            let mut seen = HashSet::new();
            match labels.iter().find(|label| !seen.insert(label.as_str())) {
                Some(clash) => Err(WorkflowError::InvalidIterable {
                    node: graph.nodes()[iterable.node.index()].name.clone(),
                    reason: format!("two values map to the directory label '{}'", clash),
                }),
                None => Ok(labels),
            }
        })
        .collect()
}

/// Readable label for a value. Labels that lose information (paths keep
/// only their file name, sanitizing rewrites characters) carry a short hash
/// of the value so distinct values never share a directory.
fn value_label(value: &Value) -> String {
    let readable = value.label();
    let safe = sanitize(&readable);
    if safe == readable && !matches!(value, Value::Path(_)) {
        return safe;
    }
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(&canonical));
    format!("{}_{}", safe, &digest[..8])
}

fn join_failure(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("panicked: {}", msg))
        .unwrap_or_else(|| "panicked".to_string())
}

/// Cartesian product of the value indices of `sources`.
fn combinations(graph: &WorkflowGraph, sources: &[usize]) -> Vec<IterationKey> {
    sources.iter().fold(vec![Vec::new()], |acc, &it| {
        let count = graph.iterables()[it].values.len();
        acc.into_iter()
            .flat_map(|prefix| {
                (0..count).map(move |v| {
                    let mut key = prefix.clone();
                    key.push((it, v));
                    key
                })
            })
            .collect()
    })
}

fn restrict(key: &IterationKey, sources: &[usize]) -> IterationKey {
    key.iter()
        .filter(|(it, _)| sources.contains(it))
        .copied()
        .collect()
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn blocked_by(graph: &WorkflowGraph, arena: &[NodeInstance], i: usize) -> Option<String> {
    arena[i]
        .deps
        .iter()
        .find(|&&d| matches!(arena[d].state, InstanceState::Failed | InstanceState::Skipped))
        .map(|&d| {
            let dep = &arena[d];
            format!(
                "upstream {}{} {}",
                graph.nodes()[dep.node.index()].name,
                dep.label,
                if dep.state == InstanceState::Failed { "failed" } else { "was skipped" }
            )
        })
}

/// Defaults, then literal parameters, then the iterable value, then edges.
fn resolve_inputs(
    graph: &WorkflowGraph,
    arena: &[NodeInstance],
    i: usize,
) -> Result<BTreeMap<String, Value>, NodeError> {
    let instance = &arena[i];
    let spec = &graph.nodes()[instance.node.index()];
    let signature = spec.operation.signature();

    let mut inputs: BTreeMap<String, Value> = signature
        .inputs
        .iter()
        .filter_map(|port| port.default.clone().map(|d| (port.name.clone(), d)))
        .collect();
    inputs.extend(spec.params.clone());

    for &(it, v) in &instance.key {
        let iterable = &graph.iterables()[it];
        if iterable.node == instance.node {
            inputs.insert(iterable.port.clone(), iterable.values[v].clone());
        }
    }

    for conn in graph.incoming(instance.node) {
        let source = instance
            .deps
            .iter()
            .map(|&d| &arena[d])
            .find(|dep| dep.node == conn.from_node)
            .ok_or_else(|| {
                NodeError::Configuration(format!("no upstream instance feeds '{}'", conn.to_port))
            })?;
        let value = source.outputs.get(&conn.from_port).cloned().ok_or_else(|| {
            NodeError::MissingInput(format!(
                "{} ('{}' produced no '{}')",
                conn.to_port,
                graph.nodes()[conn.from_node.index()].name,
                conn.from_port
            ))
        })?;
        inputs.insert(conn.to_port.clone(), value);
    }

    if let Some(port) = signature
        .inputs
        .iter()
        .find(|port| port.required && !inputs.contains_key(&port.name))
    {
        return Err(NodeError::MissingInput(port.name.clone()));
    }

    Ok(inputs)
}

fn succeed(
    graph: &WorkflowGraph,
    instance: &mut NodeInstance,
    outcome: CacheOutcome,
    duration_ms: u64,
    event_bus: &EventBus,
    execution_id: ExecutionId,
) {
    let name = &graph.nodes()[instance.node.index()].name;
    instance.state = InstanceState::Succeeded;
    instance.cached = outcome.cached;
    instance.duration_ms = duration_ms;
    instance.outputs = outcome.outputs;

    if instance.cached {
        tracing::info!("Node {}{} reused cached result", name, instance.label);
        event_bus.emit(ExecutionEvent::NodeCached {
            execution_id,
            node: name.clone(),
            instance: instance.label.clone(),
            timestamp: Utc::now(),
        });
    } else {
        tracing::info!("Node {}{} completed in {}ms", name, instance.label, duration_ms);
        event_bus.emit(ExecutionEvent::NodeCompleted {
            execution_id,
            node: name.clone(),
            instance: instance.label.clone(),
            outputs: instance.outputs.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
    }
}

fn fail(
    graph: &WorkflowGraph,
    instance: &mut NodeInstance,
    error: NodeError,
    duration_ms: u64,
    event_bus: &EventBus,
    execution_id: ExecutionId,
) {
    let name = &graph.nodes()[instance.node.index()].name;
    tracing::error!(
        "Node {}{} failed: {}; inputs: {:?}",
        name,
        instance.label,
        error,
        instance.inputs
    );
    event_bus.emit(ExecutionEvent::NodeFailed {
        execution_id,
        node: name.clone(),
        instance: instance.label.clone(),
        inputs: instance.inputs.clone(),
        error: error.to_string(),
        timestamp: Utc::now(),
    });
    instance.state = InstanceState::Failed;
    instance.duration_ms = duration_ms;
    instance.error = Some(error);
}

fn skip(
    graph: &WorkflowGraph,
    instance: &mut NodeInstance,
    reason: &str,
    event_bus: &EventBus,
    execution_id: ExecutionId,
) {
    let name = &graph.nodes()[instance.node.index()].name;
    tracing::warn!("Skipping {}{}: {}", name, instance.label, reason);
    event_bus.emit(ExecutionEvent::NodeSkipped {
        execution_id,
        node: name.clone(),
        instance: instance.label.clone(),
        reason: reason.to_string(),
        timestamp: Utc::now(),
    });
    instance.state = InstanceState::Skipped;
}

/// Everything a spawned task needs to run one node instance
struct Job {
    operation: Arc<dyn Operation>,
    kind: NodeKind,
    node_name: String,
    label: String,
    iteration: Vec<(String, Value)>,
    work_dir: PathBuf,
    inputs: BTreeMap<String, Value>,
    cache: Arc<ResultCache>,
    events: EventEmitter,
    map_parallel: usize,
    permits: Arc<Semaphore>,
}

impl Job {
    async fn run(self) -> Result<CacheOutcome, NodeError> {
        match &self.kind {
            NodeKind::Scalar => self.run_unit(None, self.inputs.clone()).await,
            NodeKind::Map { iterfield } => self.run_map(iterfield).await,
        }
    }

    async fn run_map(&self, iterfield: &BTreeSet<String>) -> Result<CacheOutcome, NodeError> {
        let mut lengths = Vec::with_capacity(iterfield.len());
        for port in iterfield {
            let value = self
                .inputs
                .get(port)
                .ok_or_else(|| NodeError::MissingInput(port.clone()))?;
            let items = value.as_array().ok_or_else(|| NodeError::InvalidInputType {
                field: port.clone(),
                expected: "array".to_string(),
                actual: value.type_name().to_string(),
            })?;
            lengths.push((port.clone(), items.len()));
        }
        let count = lengths.first().map(|(_, len)| *len).unwrap_or(0);
        if lengths.iter().any(|(_, len)| *len != count) {
            return Err(NodeError::LengthMismatch { lengths });
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        self.events.info(format!("Mapping over {} elements", count));

        // `buffered` keeps element order, so outputs stay index-aligned.
        let elements: Vec<CacheOutcome> = stream::iter((0..count).map(|i| {
            let mut inputs = self.inputs.clone();
            for port in iterfield {
                if let Some(Value::Array(items)) = self.inputs.get(port) {
                    inputs.insert(port.clone(), items[i].clone());
                }
            }
            self.run_unit(Some(i), inputs)
        }))
        .buffered(self.map_parallel)
        .try_collect()
        .await?;
        self.prune_elements(count).await?;

        let outputs = self
            .operation
            .signature()
            .outputs
            .iter()
            .map(|port| {
                let items = elements
                    .iter()
                    .map(|element| element.outputs.get(&port.name).cloned().unwrap_or(Value::Null))
                    .collect();
                (port.name.clone(), Value::Array(items))
            })
            .collect();

        Ok(CacheOutcome {
            outputs,
            cached: count > 0 && elements.iter().all(|e| e.cached),
        })
    }

    /// Remove element directories left over from a run over a longer list.
    async fn prune_elements(&self, count: usize) -> Result<(), NodeError> {
        let mapflow = self.work_dir.join("mapflow");
        let mut entries = match tokio::fs::read_dir(&mapflow).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let prefix = format!("_{}", self.node_name);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let stale = name
                .to_str()
                .and_then(|n| n.strip_prefix(prefix.as_str()))
                .and_then(|i| i.parse::<usize>().ok())
                .is_some_and(|i| i >= count);
            if stale {
                tracing::debug!("Removing stale element {}", entry.path().display());
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Run (or reuse) one invocation of the operation.
    async fn run_unit(
        &self,
        index: Option<usize>,
        inputs: BTreeMap<String, Value>,
    ) -> Result<CacheOutcome, NodeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| NodeError::Configuration(format!("scheduler closed: {}", e)))?;

        let operation_type = self.operation.operation_type();
        let contents = file_digests(&inputs).await?;
        let key = CacheKey::compute(
            operation_type,
            &self.operation.fingerprint(),
            &self.node_name,
            index,
            &self.iteration,
            &inputs,
            &contents,
        )?;

        let (work_dir, instance) = match index {
            Some(i) => (
                self.work_dir
                    .join("mapflow")
                    .join(format!("_{}{}", self.node_name, i)),
                format!("{}[{}]", self.label, i),
            ),
            None => (self.work_dir.clone(), self.label.clone()),
        };

        let ctx = OperationContext {
            node_name: self.node_name.clone(),
            instance,
            inputs: inputs.clone(),
            work_dir: work_dir.clone(),
            events: self.events.clone(),
        };
        let operation = &self.operation;

        self.cache
            .get_or_run(&key, &work_dir, operation_type, &inputs, move || {
                operation.invoke(ctx)
            })
            .await
    }
}

/// Result of workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub workflow: String,
    pub duration_ms: u64,
    pub instances: Vec<InstanceReport>,
}

impl ExecutionResult {
    /// True when no instance failed or was skipped
    pub fn is_success(&self) -> bool {
        self.instances
            .iter()
            .all(|inst| inst.state == InstanceState::Succeeded)
    }

    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|inst| inst.state == state).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &InstanceReport> {
        self.instances
            .iter()
            .filter(|inst| inst.state == InstanceState::Failed)
    }

    /// All instances of the named node, in iteration order
    pub fn instances_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a InstanceReport> + 'a {
        self.instances.iter().filter(move |inst| inst.node == node)
    }

    /// Instances whose outputs came from an existing record
    pub fn cached_count(&self) -> usize {
        self.instances.iter().filter(|inst| inst.cached).count()
    }
}

/// Final state of one node instance
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub node: String,
    pub node_id: NodeId,
    /// Iteration part of the instance directory, e.g. `_pid_P001`
    pub label: String,
    pub iteration: Vec<(String, Value)>,
    pub state: InstanceState,
    pub work_dir: PathBuf,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub cached: bool,
    pub error: Option<NodeError>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sanitized_for_paths() {
        assert_eq!(sanitize("P001"), "P001");
        assert_eq!(sanitize("a b/c"), "a_b_c");
        assert_eq!(sanitize("t1.nii.gz"), "t1.nii.gz");
    }

    #[test]
    fn lossy_labels_carry_a_hash() {
        assert_eq!(value_label(&Value::from("P001")), "P001");

        let spaced = value_label(&Value::from("a b"));
        assert!(spaced.starts_with("a_b_"));
        assert_ne!(spaced, value_label(&Value::from("a_b")));

        let site_a = value_label(&Value::Path(PathBuf::from("/siteA/t1.nii.gz")));
        let site_b = value_label(&Value::Path(PathBuf::from("/siteB/t1.nii.gz")));
        assert!(site_a.starts_with("t1.nii.gz_"));
        assert_ne!(site_a, site_b);
        assert_eq!(site_a.len(), "t1.nii.gz_".len() + 8);
    }

    #[test]
    fn restrict_keeps_only_upstream_sources() {
        let key = vec![(0, 1), (1, 0), (2, 3)];
        assert_eq!(restrict(&key, &[0, 2]), vec![(0, 1), (2, 3)]);
        assert!(restrict(&key, &[]).is_empty());
    }
}
