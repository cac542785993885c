// crates/segnodes/tests/pipeline_test.rs

use async_trait::async_trait;
use segcore::NodeError;
use segnodes::{
    register_all, AtlasConfig, FslTools, OutputType, PipelineConfig, SegT1Pipeline, SubjectInfo,
    Tissue, ToolConfig, ToolInvocation, ToolOutput, ToolRunner, METRICS_HEADER,
};
use segruntime::{InstanceState, OperationRegistry, PipelineRuntime, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Stands in for FSL and the renderer: creates every declared output and
/// answers `fslstats` with 1000 voxels of mean 0.8.
#[derive(Default)]
struct FakeRunner {
    seen: Mutex<Vec<ToolInvocation>>,
    fail_tool: Option<&'static str>,
}

impl FakeRunner {
    fn failing(tool: &'static str) -> Self {
        Self {
            fail_tool: Some(tool),
            ..Default::default()
        }
    }

    fn invocations_of(&self, tool: &str) -> Vec<ToolInvocation> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.tool_name() == tool)
            .cloned()
            .collect()
    }

    fn count_except(&self, tools: &[&str]) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| !tools.contains(&inv.tool_name().as_str()))
            .count()
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, NodeError> {
        self.seen.lock().unwrap().push(invocation.clone());
        let tool = invocation.tool_name();
        if self.fail_tool == Some(tool.as_str()) {
            return Err(NodeError::operation_failed(tool, Some(1), "segmentation diverged"));
        }
        for path in &invocation.produces {
            std::fs::write(path, tool.as_bytes())?;
        }
        let stdout = if tool == "fslstats" {
            "1000 1250.000000 0.800000 \n".to_string()
        } else {
            String::new()
        };
        Ok(ToolOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    parent: PathBuf,
    config: PipelineConfig,
}

fn fixture(pca: i64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let parent = dir.path().join("P001");
    let atlas = dir.path().join("atlas");
    std::fs::create_dir_all(&parent).unwrap();
    std::fs::create_dir_all(&atlas).unwrap();
    std::fs::write(parent.join("P001_T13D.nii.gz"), b"t1").unwrap();

    let config = PipelineConfig {
        subject: SubjectInfo {
            parent_dir: parent.clone(),
            pid: "P001".to_string(),
            pca,
            t1_crop_box: [10, 100, 20, 120, 0, 90],
            t1_center: [50.0, 60.0, 40.0],
        },
        atlas: AtlasConfig {
            template: atlas.join("template_T1.nii.gz"),
            tissue_dir: atlas.clone(),
            fnirt_config: atlas.join("FNIRTconfig.cnf"),
        },
        tools: ToolConfig {
            fsl_bin: PathBuf::from("/opt/fsl/bin"),
            output_type: OutputType::NiftiGz,
            renderer: PathBuf::from("/usr/local/bin/render"),
        },
    };
    Fixture {
        _dir: dir,
        parent,
        config,
    }
}

fn setup(config: &PipelineConfig, runner: Arc<FakeRunner>) -> (SegT1Pipeline, PipelineRuntime, FslTools) {
    let tools = FslTools::new(runner, &config.tools);
    let mut registry = OperationRegistry::new();
    register_all(&mut registry, &tools);
    let registry = Arc::new(registry);

    let pipeline = SegT1Pipeline::build(config.clone(), &registry).unwrap();
    let runtime = PipelineRuntime::with_registry(registry, RuntimeConfig::default());
    (pipeline, runtime, tools)
}

fn exists(path: &Path) -> bool {
    path.is_file()
}

#[test]
fn registry_lists_every_pipeline_operation() {
    let f = fixture(30);
    let (pipeline, runtime, _) = setup(&f.config, Arc::new(FakeRunner::default()));

    let types = runtime.registry().list_operation_types();
    for node in pipeline.graph().nodes() {
        assert!(types.iter().any(|t| t == node.operation_type()), "{}", node.name);
    }
    assert_eq!(pipeline.graph().nodes().len(), 12);
    assert!(pipeline.graph().validate().is_ok());
}

#[tokio::test]
async fn age_30_run_produces_full_output_tree() {
    let f = fixture(30);
    let runner = Arc::new(FakeRunner::default());
    let (pipeline, runtime, tools) = setup(&f.config, runner.clone());

    let outcome = pipeline.run(&runtime, &tools).await.unwrap();

    assert!(outcome.is_success());
    let outputs = f.parent.join("SegT1").join("Outputs");
    let layout = pipeline.layout();

    for tissue in Tissue::ALL {
        assert!(exists(&layout.mask(tissue)), "{:?}", tissue);
    }
    assert!(exists(&layout.bias_corrected()));
    assert!(exists(&outputs.join("T1_Standard_Space/P001/P001_T1_StdSpace.nii.gz")));
    assert!(exists(&outputs.join("Fast_PVE/P001/P001_pve_2.nii.gz")));
    assert!(exists(&f.parent.join("SegT1").join("graph.dot")));

    // Age 30 selects atlas volume 2 for both the template and the masks.
    let template_args = runner
        .invocations_of("fslroi")
        .into_iter()
        .filter(|inv| inv.args[0].ends_with("template_T1.nii.gz") || inv.args[0].ends_with("brainstem.nii.gz"))
        .map(|inv| inv.args[2..].to_vec())
        .collect::<Vec<_>>();
    assert_eq!(template_args, vec![vec!["2", "1"], vec!["2", "1"]]);

    let metrics = std::fs::read_to_string(outputs.join("Metrics.csv")).unwrap();
    assert_eq!(
        metrics,
        format!("{}\nT1,800.0,800.0,800.0,800.0,800.0,800.0\n", METRICS_HEADER)
    );
    assert_eq!(outcome.metrics.as_ref().unwrap().volumes, [800.0; 6]);

    let image = outcome.image.clone().unwrap();
    assert_eq!(image, outputs.join("P001_T1_Segmentation.png"));
    assert!(exists(&image));
    assert_eq!(runner.invocations_of("render").len(), 1);

    let manifest = outcome.manifest.as_ref().unwrap();
    assert_eq!(manifest.in_category("T1_Tissue_Classes").count(), 7);
    assert_eq!(manifest.in_category("Fast_PVE").count(), 3);
    assert!(exists(&outputs.join("manifest.json")));

    for instance in &outcome.execution.instances {
        assert_eq!(instance.state, InstanceState::Succeeded);
        assert!(instance.work_dir.is_dir(), "{}", instance.work_dir.display());
    }
}

#[tokio::test]
async fn rerun_reuses_every_graph_result() {
    let f = fixture(30);
    let runner = Arc::new(FakeRunner::default());
    let (pipeline, runtime, tools) = setup(&f.config, runner.clone());

    pipeline.run(&runtime, &tools).await.unwrap();
    let first = runner.count_except(&["fslstats", "render"]);
    assert_eq!(first, 21);

    let again = pipeline.run(&runtime, &tools).await.unwrap();

    assert!(again.is_success());
    assert_eq!(runner.count_except(&["fslstats", "render"]), first);
    assert_eq!(again.execution.cached_count(), again.execution.instances.len());
}

#[tokio::test]
async fn segmentation_failure_stops_before_aggregation() {
    let f = fixture(30);
    let runner = Arc::new(FakeRunner::failing("fast"));
    let (pipeline, runtime, tools) = setup(&f.config, runner.clone());

    let outcome = pipeline.run(&runtime, &tools).await.unwrap();

    assert!(!outcome.is_success());
    let state = |name: &str| outcome.execution.instances_of(name).next().unwrap().state;
    assert_eq!(state("FastSeg"), InstanceState::Failed);
    for downstream in ["T1linTemplate", "T1warpTemplate", "inverse_T1_warp", "apply_T1_warp"] {
        assert_eq!(state(downstream), InstanceState::Skipped, "{}", downstream);
    }
    assert_eq!(state("get_masks"), InstanceState::Succeeded);
    assert_eq!(state("get_T1_template"), InstanceState::Succeeded);

    let failed = outcome.execution.failed().next().unwrap();
    assert!(matches!(
        failed.error,
        Some(NodeError::OperationFailed { status: Some(1), ref diagnostics, .. }) if diagnostics == "segmentation diverged"
    ));

    let outputs = f.parent.join("SegT1").join("Outputs");
    assert!(!outputs.join("Metrics.csv").exists());
    assert!(!outputs.join("P001_T1_Segmentation.png").exists());
    assert!(outcome.manifest.is_none());
    assert!(runner.invocations_of("fslstats").is_empty());
}

#[tokio::test]
async fn missing_scan_fails_the_data_grabber() {
    let f = fixture(44);
    std::fs::remove_file(f.parent.join("P001_T13D.nii.gz")).unwrap();
    let runner = Arc::new(FakeRunner::default());
    let (pipeline, runtime, tools) = setup(&f.config, runner.clone());

    let outcome = pipeline.run(&runtime, &tools).await.unwrap();

    let datasource = outcome.execution.instances_of("datasource").next().unwrap();
    assert_eq!(datasource.state, InstanceState::Failed);
    assert!(runner.invocations_of("bet").is_empty());
    // Atlas-side nodes still ran, at the oldest template volume.
    let template = runner
        .invocations_of("fslroi")
        .into_iter()
        .find(|inv| inv.args[0].ends_with("template_T1.nii.gz"))
        .unwrap();
    assert_eq!(&template.args[2..], ["16", "1"]);
}
