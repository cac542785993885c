use crate::{events::EventEmitter, NodeError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Core capability implemented by every wrapped external tool
///
/// Operations must be idempotent for identical inputs; the result cache
/// relies on it.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Unique type identifier (e.g., "fsl.bet", "io.datagrabber")
    fn operation_type(&self) -> &str;

    /// Declared input and output ports
    fn signature(&self) -> &Signature;

    /// Run the operation once with fully resolved inputs
    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError>;

    /// Extra identity folded into cache keys (tool location, static settings).
    fn fingerprint(&self) -> Value {
        Value::Null
    }
}

/// Execution context passed to each invocation
#[derive(Clone)]
pub struct OperationContext {
    /// Name of the graph node being executed
    pub node_name: String,

    /// Instance label (iteration values and map index), for diagnostics
    pub instance: String,

    /// Resolved input values, keyed by port name
    pub inputs: BTreeMap<String, Value>,

    /// Directory the operation writes its files into; created by the engine
    pub work_dir: PathBuf,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl OperationContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get input with default
    pub fn get_input_or(&self, name: &str, default: Value) -> Value {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or(default)
    }

    pub fn require_path(&self, name: &str) -> Result<&Path, NodeError> {
        let value = self.require_input(name)?;
        value.as_path().ok_or_else(|| invalid_type(name, "path", value))
    }

    pub fn optional_f64(&self, name: &str) -> Result<Option<f64>, NodeError> {
        match self.inputs.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| invalid_type(name, "number", v)),
        }
    }

    pub fn optional_i64(&self, name: &str) -> Result<Option<i64>, NodeError> {
        match self.inputs.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| invalid_type(name, "integer", v)),
        }
    }

    pub fn flag(&self, name: &str) -> Result<bool, NodeError> {
        match self.inputs.get(name) {
            None | Some(Value::Null) => Ok(false),
            Some(v) => v.as_bool().ok_or_else(|| invalid_type(name, "bool", v)),
        }
    }

    /// Path of a file inside the working directory
    pub fn output_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(file_name)
    }
}

pub(crate) fn invalid_type(field: &str, expected: &str, actual: &Value) -> NodeError {
    NodeError::InvalidInputType {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

/// Declared ports of an operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn find_input(&self, name: &str) -> Option<&PortDefinition> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.find_input(name).is_some()
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl PortDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    /// Output ports are never "required"; the flag is ignored for them.
    pub fn output(name: impl Into<String>) -> Self {
        Self::optional(name)
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Output from one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Output port values
    pub outputs: BTreeMap<String, Value>,

    /// Execution metadata
    pub metadata: OutputMetadata,
}

impl OperationOutput {
    pub fn new() -> Self {
        Self {
            outputs: BTreeMap::new(),
            metadata: OutputMetadata::default(),
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.metadata.diagnostics = Some(diagnostics.into());
        self
    }
}

impl Default for OperationOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata about one invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub execution_time_ms: u64,
    pub diagnostics: Option<String>,
}
