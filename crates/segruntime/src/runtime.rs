use crate::{registry::OperationRegistry, ExecutionResult, ResultCache, WorkflowExecutor};
use segcore::{EventBus, FlowError, WorkflowGraph};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflow graphs
///
/// The result cache is shared by every execution started from the same
/// runtime, so concurrent runs never duplicate work for one cache key.
pub struct PipelineRuntime {
    registry: Arc<OperationRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
}

impl PipelineRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Arc::new(OperationRegistry::new());
        Self::with_registry(registry, config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<OperationRegistry>, config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkflowExecutor::with_cache(
            config.max_parallel_nodes,
            Arc::new(ResultCache::new()),
        ));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Self {
            registry,
            executor,
            event_bus,
        }
    }

    /// Get access to the operation registry
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Execute a workflow graph
    pub async fn execute(&self, graph: &WorkflowGraph) -> Result<ExecutionResult, FlowError> {
        self.executor.execute(graph, &self.event_bus).await
    }

    /// Execute a workflow graph, stopping new instances once `cancel` fires
    pub async fn execute_with_cancellation(
        &self,
        graph: &WorkflowGraph,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, FlowError> {
        self.executor
            .execute_with_cancellation(graph, &self.event_bus, cancel)
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<segcore::ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
        }
    }
}
