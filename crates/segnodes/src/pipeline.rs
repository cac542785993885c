//! The SegT1 workflow
//!
//! Crop, skull-strip and segment the T1 scan, register it to the
//! age-matched template, and bring the atlas tissue masks back into subject
//! space. Afterwards the results are sunk into `SegT1/Outputs`, measured and
//! rendered.

use crate::aggregate::{self, AggregateError, TissueLayout, VolumeRecord};
use crate::config::PipelineConfig;
use crate::datagrabber::DataGrabber;
use crate::fsl::{ApplyWarp, Bet, ExtractRoi, Fast, Flirt, Fnirt, FslTools, InvWarp};
use crate::utility::{IdentityOperation, TemplateIndexOperation};
use crate::visualize::{CompositeImage, STRIP_SLICES};
use segcore::{FlowError, NodeSpec, Value, WorkflowError, WorkflowGraph};
use segruntime::{
    CancellationToken, DataSink, ExecutionResult, OperationRegistry, PipelineRuntime, SinkManifest,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub const WORKFLOW_NAME: &str = "SegT1";
pub const CONTRAST: &str = "T1";

/// Sink rewrites, applied in this order to every generated path
pub const SUBSTITUTIONS: [(&str, &str); 6] = [
    ("_apply_T1_warp", ""),
    ("_T13D_roi_brain_restore_warped", "_T1_StdSpace"),
    ("_T13D_roi_brain_restore", "_T1_Bias_Corrected"),
    ("T13D_roi_brain_pve", "pve"),
    ("_roi_warp", ""),
    ("_pid_", ""),
];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// What a run produced. Everything after execution is absent when an
/// instance failed or was skipped.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub execution: ExecutionResult,
    pub manifest: Option<SinkManifest>,
    pub metrics: Option<VolumeRecord>,
    pub metrics_file: Option<PathBuf>,
    pub image: Option<PathBuf>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.execution.is_success()
    }
}

pub struct SegT1Pipeline {
    config: PipelineConfig,
    graph: WorkflowGraph,
    sink: DataSink,
}

fn object<const N: usize>(entries: [(&str, Value); N]) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

impl SegT1Pipeline {
    /// Wire the graph from operations created through `registry`.
    pub fn build(config: PipelineConfig, registry: &OperationRegistry) -> Result<Self, WorkflowError> {
        let subject = &config.subject;
        let atlas = &config.atlas;
        let mut graph = WorkflowGraph::new(WORKFLOW_NAME, &subject.parent_dir);

        let infosource = graph.add_node(NodeSpec::new(
            "infosource",
            registry.create(
                IdentityOperation::TYPE,
                &object([("fields", Value::from(vec!["pid"]))]),
            )?,
        ))?;
        graph.declare_iterable(infosource, "pid", vec![Value::from(subject.pid.as_str())])?;

        let datasource = graph.add_node(
            NodeSpec::new(
                "datasource",
                registry.create(
                    DataGrabber::TYPE,
                    &object([
                        ("infields", Value::from(vec!["pid"])),
                        ("outfields", Value::from(vec!["T1"])),
                    ]),
                )?,
            )
            .with_param("base_directory", subject.parent_dir.as_path())
            .with_param("template", "%s")
            .with_param(
                "field_template",
                Value::Object(object([("T1", Value::from("%s_T13D.nii.gz"))])),
            )
            .with_param(
                "template_args",
                Value::Object(object([("T1", Value::from(vec![Value::from(vec!["pid"])]))])),
            )
            .with_param("sort_filelist", false),
        )?;

        let [x0, x1, y0, y1, z0, z1] = subject.t1_crop_box;
        let crop = graph.add_node(
            NodeSpec::new("cropT1", registry.create_default(ExtractRoi::TYPE)?)
                .with_param("x_min", x0)
                .with_param("x_size", x1 - x0)
                .with_param("y_min", y0)
                .with_param("y_size", y1 - y0)
                .with_param("z_min", z0)
                .with_param("z_size", z1 - z0),
        )?;

        let bet = graph.add_node(
            NodeSpec::new("betT1", registry.create_default(Bet::TYPE)?)
                .with_param("frac", 0.2)
                .with_param("robust", true)
                .with_param("center", subject.t1_center.to_vec()),
        )?;

        let fast = graph.add_node(
            NodeSpec::new("FastSeg", registry.create_default(Fast::TYPE)?)
                .with_param("output_biascorrected", true)
                .with_param("img_type", 1),
        )?;

        let template_index = graph.add_node(
            NodeSpec::new(
                "get_template_index",
                registry.create_default(TemplateIndexOperation::TYPE)?,
            )
            .with_param("PCA", subject.pca),
        )?;

        let template = graph.add_node(
            NodeSpec::new("get_T1_template", registry.create_default(ExtractRoi::TYPE)?)
                .with_param("in_file", atlas.template.as_path())
                .with_param("t_size", 1),
        )?;

        let search = Value::from(vec![-180, 180]);
        let linear = graph.add_node(
            NodeSpec::new("T1linTemplate", registry.create_default(Flirt::TYPE)?)
                .with_param("dof", 12)
                .with_param("searchr_x", search.clone())
                .with_param("searchr_y", search.clone())
                .with_param("searchr_z", search),
        )?;

        let warp = graph.add_node(
            NodeSpec::new("T1warpTemplate", registry.create_default(Fnirt::TYPE)?)
                .with_param("field_file", true)
                .with_param("config_file", atlas.fnirt_config.as_path()),
        )?;

        let inverse = graph.add_node(NodeSpec::new(
            "inverse_T1_warp",
            registry.create_default(InvWarp::TYPE)?,
        ))?;

        let masks = graph.add_node(
            NodeSpec::map("get_masks", registry.create_default(ExtractRoi::TYPE)?, ["in_file"])
                .with_param("in_file", atlas.tissue_masks())
                .with_param("t_size", 1),
        )?;

        let apply = graph.add_node(
            NodeSpec::map("apply_T1_warp", registry.create_default(ApplyWarp::TYPE)?, ["in_file"])
                .with_param("interp", "nn"),
        )?;

        graph.connect(infosource, "pid", datasource, "pid")?;
        graph.connect(datasource, "T1", crop, "in_file")?;
        graph.connect(crop, "roi_file", bet, "in_file")?;
        graph.connect(bet, "out_file", fast, "in_files")?;
        graph.connect(fast, "restored_image", linear, "in_file")?;
        graph.connect(template_index, "index", template, "t_min")?;
        graph.connect(template, "roi_file", linear, "reference")?;
        graph.connect(fast, "restored_image", warp, "in_file")?;
        graph.connect(linear, "out_matrix_file", warp, "affine_file")?;
        graph.connect(template, "roi_file", warp, "ref_file")?;
        graph.connect(warp, "field_file", inverse, "in_file")?;
        graph.connect(fast, "restored_image", inverse, "ref_file")?;
        graph.connect(template_index, "index", masks, "t_min")?;
        graph.connect(masks, "roi_file", apply, "in_file")?;
        graph.connect(inverse, "out_file", apply, "field_file")?;
        graph.connect(fast, "restored_image", apply, "ref_file")?;

        let mut sink = SUBSTITUTIONS
            .iter()
            .fold(DataSink::new(config.outputs_dir()), |sink, (pattern, replacement)| {
                sink.substitute(*pattern, *replacement)
            });
        sink.sink(&graph, warp, "warped_file", "T1_Standard_Space")?;
        sink.sink(&graph, fast, "partial_volume_files", "Fast_PVE")?;
        sink.sink(&graph, apply, "out_file", "T1_Tissue_Classes")?;
        sink.sink(&graph, fast, "restored_image", "T1_Bias_Corrected")?;

        Ok(Self {
            config,
            graph,
            sink,
        })
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn sink(&self) -> &DataSink {
        &self.sink
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> TissueLayout {
        TissueLayout::new(self.config.outputs_dir(), &self.config.subject.pid, CONTRAST)
    }

    pub async fn run(
        &self,
        runtime: &PipelineRuntime,
        tools: &FslTools,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.run_with_cancellation(runtime, tools, CancellationToken::new())
            .await
    }

    /// Execute the graph, then sink, measure and render. Post-processing
    /// only happens when every instance succeeded.
    pub async fn run_with_cancellation(
        &self,
        runtime: &PipelineRuntime,
        tools: &FslTools,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.graph.write_graph().map_err(FlowError::Io)?;

        let execution = runtime
            .execute_with_cancellation(&self.graph, cancel)
            .await?;

        if !execution.is_success() {
            for instance in execution.failed() {
                tracing::error!(
                    "{}{} failed with inputs {:?}",
                    instance.node,
                    instance.label,
                    instance.inputs
                );
            }
            return Ok(PipelineOutcome {
                execution,
                manifest: None,
                metrics: None,
                metrics_file: None,
                image: None,
            });
        }

        let manifest = self.sink.collect(&self.graph, &execution).await?;

        let layout = self.layout();
        let record = aggregate::measure(&layout, tools).await?;
        let metrics_file = layout.metrics_file();
        aggregate::write_metrics(&metrics_file, std::slice::from_ref(&record)).await?;

        let image = CompositeImage::tissue_composite(&layout)?
            .save_strip(
                self.config.subject.t1_center,
                STRIP_SLICES,
                &layout.segmentation_image(),
                &self.config.tools.renderer,
                tools.runner().as_ref(),
            )
            .await?;

        Ok(PipelineOutcome {
            execution,
            manifest: Some(manifest),
            metrics: Some(record),
            metrics_file: Some(metrics_file),
            image: Some(image),
        })
    }
}
