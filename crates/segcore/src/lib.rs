//! Core abstractions for the segmentation workflow engine
//!
//! This crate provides the fundamental types that all other components
//! depend on: dynamic values, the `Operation` capability, the
//! `WorkflowGraph` with its validation, and execution events.

mod error;
pub mod events;
mod node;
mod value;
mod workflow;

pub use error::{FlowError, NodeError, PortDirection, WorkflowError};
pub use events::*;
pub use node::{
    Operation, OperationContext, OperationOutput, OutputMetadata, PortDefinition, Signature,
};
pub use value::Value;
pub use workflow::{
    Connection, ExecutionPlan, Iterable, NodeId, NodeKind, NodeSpec, WorkflowGraph,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
