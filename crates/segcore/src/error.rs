use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while resolving or running a single node instance.
///
/// These mark the instance `Failed`; they never abort independent instances.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Iterfield length mismatch: {}", format_lengths(.lengths))]
    LengthMismatch { lengths: Vec<(String, usize)> },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation '{operation}' failed ({}): {diagnostics}", format_status(.status))]
    OperationFailed {
        operation: String,
        status: Option<i32>,
        diagnostics: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl NodeError {
    pub fn operation_failed(
        operation: impl Into<String>,
        status: Option<i32>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            status,
            diagnostics: diagnostics.into(),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(e: std::io::Error) -> Self {
        NodeError::Io(e.to_string())
    }
}

fn format_lengths(lengths: &[(String, usize)]) -> String {
    lengths
        .iter()
        .map(|(port, len)| format!("{}={}", port, len))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "no exit status".to_string(),
    }
}

/// Malformed graph configuration. Always raised before anything executes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("Node '{node}' has no {direction} port '{port}'")]
    Port {
        node: String,
        port: String,
        direction: PortDirection,
    },

    #[error("Input port '{node}.{port}' is already bound")]
    PortConflict { node: String, port: String },

    #[error("Required input '{node}.{port}' is neither connected nor bound to a value")]
    UnboundInput { node: String, port: String },

    #[error("Invalid iterable on '{node}': {reason}")]
    InvalidIterable { node: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}
