use segcore::{NodeError, Operation, Signature, Value, WorkflowError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Factory trait for creating operation instances
pub trait OperationFactory: Send + Sync {
    /// Create a new instance of the operation with given configuration
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Operation>, NodeError>;

    /// Get operation type identifier
    fn operation_type(&self) -> &str;

    /// Optional: Get metadata (description, category)
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::default()
    }
}

/// Metadata about an operation type
#[derive(Debug, Clone)]
pub struct OperationMetadata {
    pub description: String,
    pub category: String,
}

impl Default for OperationMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of available operation types
pub struct OperationRegistry {
    factories: HashMap<String, Arc<dyn OperationFactory>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an operation factory, replacing any previous one for the type
    pub fn register(&mut self, factory: Arc<dyn OperationFactory>) {
        let operation_type = factory.operation_type().to_string();
        tracing::debug!("Registering operation type: {}", operation_type);
        self.factories.insert(operation_type, factory);
    }

    /// Create an operation from its type and config
    pub fn create(
        &self,
        operation_type: &str,
        config: &BTreeMap<String, Value>,
    ) -> Result<Arc<dyn Operation>, WorkflowError> {
        let factory = self
            .factories
            .get(operation_type)
            .ok_or_else(|| WorkflowError::UnknownOperation(operation_type.to_string()))?;

        factory.create(config).map_err(|e| {
            WorkflowError::Invalid(format!("Failed to create '{}': {}", operation_type, e))
        })
    }

    /// Create an operation that needs no configuration
    pub fn create_default(&self, operation_type: &str) -> Result<Arc<dyn Operation>, WorkflowError> {
        self.create(operation_type, &BTreeMap::new())
    }

    /// Get all registered operation types, sorted
    pub fn list_operation_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for an operation type
    pub fn get_metadata(&self, operation_type: &str) -> Option<OperationMetadata> {
        self.factories.get(operation_type).map(|f| f.metadata())
    }

    /// Ports of an operation type as created with an empty config
    pub fn signature(&self, operation_type: &str) -> Option<Signature> {
        self.create_default(operation_type)
            .ok()
            .map(|op| op.signature().clone())
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
