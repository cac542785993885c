//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflow graphs: instance
//! expansion for iterables and map nodes, the on-disk result cache, the
//! operation registry and the result sink.

mod cache;
mod executor;
mod registry;
mod runtime;
mod sink;

pub use cache::{CacheKey, CacheOutcome, CacheRecord, Lookup, ResultCache, RECORD_FILE};
pub use executor::{ExecutionResult, InstanceReport, InstanceState, WorkflowExecutor};
pub use registry::{OperationFactory, OperationMetadata, OperationRegistry};
pub use runtime::{PipelineRuntime, RuntimeConfig};
pub use sink::{DataSink, ManifestEntry, SinkManifest, Substitution, MANIFEST_FILE};

pub use tokio_util::sync::CancellationToken;
