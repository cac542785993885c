//! Neonatal T1 segmentation operations
//!
//! FSL tool wrappers, input discovery and utility operations, plus the
//! SegT1 pipeline that wires them together and the post-run aggregation.

mod aggregate;
mod config;
mod datagrabber;
mod fsl;
mod pipeline;
mod tool;
mod utility;
mod visualize;

pub use aggregate::{
    format_significant, measure, volume, write_metrics, AggregateError, Tissue, TissueLayout,
    VolumeRecord, METRICS_FILE, METRICS_HEADER,
};
pub use config::{AtlasConfig, ConfigError, OutputType, PipelineConfig, SubjectInfo, ToolConfig};
pub use datagrabber::{fill_template, DataGrabber, DataGrabberFactory};
pub use fsl::{
    image_stats, image_stem, ApplyWarp, Bet, ExtractRoi, Fast, Flirt, Fnirt, FslOperationFactory,
    FslTools, ImageStats, InvWarp,
};
pub use pipeline::{
    PipelineError, PipelineOutcome, SegT1Pipeline, CONTRAST, SUBSTITUTIONS, WORKFLOW_NAME,
};
pub use tool::{verify_outputs, ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
pub use utility::{
    template_index, IdentityFactory, IdentityOperation, TemplateIndexFactory,
    TemplateIndexOperation,
};
pub use visualize::{CompositeImage, Overlay, StripRequest, OVERLAY_ORDER, STRIP_SLICES};

use segruntime::OperationRegistry;
use std::sync::Arc;

/// Register every operation the pipeline uses
pub fn register_all(registry: &mut OperationRegistry, tools: &FslTools) {
    for factory in FslOperationFactory::all(tools) {
        registry.register(Arc::new(factory));
    }
    registry.register(Arc::new(IdentityFactory));
    registry.register(Arc::new(TemplateIndexFactory));
    registry.register(Arc::new(DataGrabberFactory));
}
