//! FSL command line tools wrapped as operations
//!
//! Output files are named after the input image the way FSL's own wrappers
//! name them (`<stem>_roi`, `<stem>_brain`, ...); the sink substitutions
//! depend on these names.

use crate::config::{OutputType, ToolConfig};
use crate::tool::{ToolInvocation, ToolOutput, ToolRunner};
use async_trait::async_trait;
use segcore::{
    NodeError, Operation, OperationContext, OperationOutput, PortDefinition, Signature, Value,
};
use segruntime::{OperationFactory, OperationMetadata};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the FSL binaries live and how their output is written
#[derive(Clone)]
pub struct FslTools {
    runner: Arc<dyn ToolRunner>,
    bin: PathBuf,
    output_type: OutputType,
}

impl FslTools {
    pub fn new(runner: Arc<dyn ToolRunner>, config: &ToolConfig) -> Self {
        Self {
            runner,
            bin: config.fsl_bin.clone(),
            output_type: config.output_type,
        }
    }

    pub fn runner(&self) -> &Arc<dyn ToolRunner> {
        &self.runner
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    pub fn invocation(&self, program: &str, work_dir: &Path) -> ToolInvocation {
        ToolInvocation::new(self.bin.join(program), work_dir)
            .env("FSLOUTPUTTYPE", self.output_type.as_env())
    }

    /// `<work_dir>/<stem of input><suffix><image extension>`
    pub fn output_file(&self, work_dir: &Path, input: &Path, suffix: &str) -> PathBuf {
        work_dir.join(format!(
            "{}{}{}",
            image_stem(input),
            suffix,
            self.output_type.extension()
        ))
    }

    async fn run(
        &self,
        ctx: &OperationContext,
        invocation: ToolInvocation,
    ) -> Result<ToolOutput, NodeError> {
        ctx.events.info(format!("Running {}", invocation.command_line()));
        self.runner.run(&invocation).await
    }

    fn fingerprint(&self) -> Value {
        let mut fp = BTreeMap::new();
        fp.insert("bin".to_string(), Value::from(self.bin.as_path()));
        fp.insert("output_type".to_string(), Value::from(self.output_type.as_env()));
        Value::Object(fp)
    }
}

/// File name without its image extension
pub fn image_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in [".nii.gz", ".nii", ".img.gz", ".img", ".hdr"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    name
}

/// Run `fslstats <image> <op_string>` and parse the numbers it prints.
pub async fn image_stats(
    tools: &FslTools,
    image: &Path,
    op_string: &str,
    work_dir: &Path,
) -> Result<Vec<f64>, NodeError> {
    let invocation = tools
        .invocation("fslstats", work_dir)
        .path_arg(image)
        .args(op_string.split_whitespace());
    let output = tools.runner.run(&invocation).await?;
    parse_stats(&output.stdout)
}

fn parse_stats(stdout: &str) -> Result<Vec<f64>, NodeError> {
    let values = stdout
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            NodeError::operation_failed(
                "fslstats",
                Some(0),
                format!("unparseable output {:?}: {}", stdout.trim(), e),
            )
        })?;
    if values.is_empty() {
        return Err(NodeError::operation_failed("fslstats", Some(0), "no output"));
    }
    Ok(values)
}

fn number(value: f64) -> String {
    Value::Number(value).label()
}

fn numbers(ctx: &OperationContext, field: &str, len: usize) -> Result<Option<Vec<f64>>, NodeError> {
    let Some(value) = ctx.inputs.get(field).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let items = value
        .as_array()
        .and_then(|items| items.iter().map(Value::as_f64).collect::<Option<Vec<_>>>())
        .filter(|items| items.len() == len)
        .ok_or_else(|| NodeError::InvalidInputType {
            field: field.to_string(),
            expected: format!("array of {} numbers", len),
            actual: value.type_name().to_string(),
        })?;
    Ok(Some(items))
}

/// `fslroi`: crop a spatial box and/or select a volume range
pub struct ExtractRoi {
    tools: FslTools,
    signature: Signature,
}

const SPATIAL: [&str; 6] = ["x_min", "x_size", "y_min", "y_size", "z_min", "z_size"];

impl ExtractRoi {
    pub const TYPE: &'static str = "fsl.extract_roi";

    pub fn new(tools: FslTools) -> Self {
        let signature = SPATIAL
            .iter()
            .chain(["t_min", "t_size"].iter())
            .fold(
                Signature::new().input(PortDefinition::required("in_file")),
                |sig, port| sig.input(PortDefinition::optional(*port)),
            )
            .output(PortDefinition::output("roi_file"));
        Self { tools, signature }
    }
}

#[async_trait]
impl Operation for ExtractRoi {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let roi_file = self.tools.output_file(&ctx.work_dir, in_file, "_roi");

        let spatial = SPATIAL
            .iter()
            .map(|port| ctx.optional_i64(port))
            .collect::<Result<Vec<_>, _>>()?;
        let mut region: Vec<i64> = match spatial.iter().filter(|v| v.is_some()).count() {
            0 => Vec::new(),
            6 => spatial.into_iter().flatten().collect(),
            _ => {
                return Err(NodeError::Configuration(
                    "a spatial region needs all of x/y/z min and size".to_string(),
                ))
            }
        };
        match (ctx.optional_i64("t_min")?, ctx.optional_i64("t_size")?) {
            (None, None) => {}
            (t_min, Some(t_size)) => region.extend([t_min.unwrap_or(0), t_size]),
            (Some(_), None) => {
                return Err(NodeError::Configuration("t_min given without t_size".to_string()))
            }
        }
        if region.is_empty() {
            return Err(NodeError::Configuration("no region to extract".to_string()));
        }

        let invocation = self
            .tools
            .invocation("fslroi", &ctx.work_dir)
            .path_arg(in_file)
            .path_arg(&roi_file)
            .args(region.iter().map(i64::to_string))
            .produces(&roi_file);
        self.tools.run(&ctx, invocation).await?;

        Ok(OperationOutput::new().with_output("roi_file", roi_file))
    }
}

/// `bet`: brain extraction
pub struct Bet {
    tools: FslTools,
    signature: Signature,
}

impl Bet {
    pub const TYPE: &'static str = "fsl.bet";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file"))
                .input(
                    PortDefinition::optional("frac")
                        .with_default(0.5)
                        .describe("Fractional intensity threshold"),
                )
                .input(PortDefinition::optional("robust").describe("Robust centre estimation"))
                .input(PortDefinition::optional("center").describe("Centre of gravity, in voxels"))
                .output(PortDefinition::output("out_file")),
        }
    }
}

#[async_trait]
impl Operation for Bet {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let out_file = self.tools.output_file(&ctx.work_dir, in_file, "_brain");
        let frac = ctx.optional_f64("frac")?.unwrap_or(0.5);

        let mut invocation = self
            .tools
            .invocation("bet", &ctx.work_dir)
            .path_arg(in_file)
            .path_arg(&out_file)
            .args(["-f".to_string(), number(frac)]);
        if ctx.flag("robust")? {
            invocation = invocation.arg("-R");
        }
        if let Some(center) = numbers(&ctx, "center", 3)? {
            invocation = invocation.arg("-c").args(center.into_iter().map(number));
        }
        self.tools.run(&ctx, invocation.produces(&out_file)).await?;

        Ok(OperationOutput::new().with_output("out_file", out_file))
    }
}

/// `fast`: tissue segmentation with optional bias correction
pub struct Fast {
    tools: FslTools,
    signature: Signature,
}

impl Fast {
    pub const TYPE: &'static str = "fsl.fast";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_files"))
                .input(
                    PortDefinition::optional("img_type")
                        .with_default(1)
                        .describe("1 = T1, 2 = T2, 3 = PD"),
                )
                .input(PortDefinition::optional("number_classes").with_default(3))
                .input(PortDefinition::optional("output_biascorrected"))
                .output(PortDefinition::output("restored_image"))
                .output(PortDefinition::output("partial_volume_files"))
                .output(PortDefinition::output("tissue_class_map")),
        }
    }
}

#[async_trait]
impl Operation for Fast {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        // A single-element list is accepted as well as a bare path.
        let in_value = ctx.require_input("in_files")?;
        let in_file = match in_value {
            Value::Array(items) if items.len() == 1 => items[0].as_path(),
            other => other.as_path(),
        }
        .ok_or_else(|| NodeError::InvalidInputType {
            field: "in_files".to_string(),
            expected: "path".to_string(),
            actual: in_value.type_name().to_string(),
        })?;

        let img_type = ctx.optional_i64("img_type")?.unwrap_or(1);
        let classes = ctx.optional_i64("number_classes")?.unwrap_or(3);
        let bias_corrected = ctx.flag("output_biascorrected")?;
        if classes < 1 {
            return Err(NodeError::Configuration(format!(
                "number_classes must be positive, got {}",
                classes
            )));
        }

        let base = ctx.work_dir.join(image_stem(in_file));
        let pve: Vec<PathBuf> = (0..classes)
            .map(|i| self.tools.output_file(&ctx.work_dir, &base, &format!("_pve_{}", i)))
            .collect();
        let seg = self.tools.output_file(&ctx.work_dir, &base, "_seg");
        let restored = self.tools.output_file(&ctx.work_dir, &base, "_restore");

        let mut invocation = self
            .tools
            .invocation("fast", &ctx.work_dir)
            .args(["-t".to_string(), img_type.to_string()])
            .args(["-n".to_string(), classes.to_string()])
            .arg("-o")
            .path_arg(&base);
        if bias_corrected {
            invocation = invocation.arg("-B").produces(&restored);
        }
        invocation = pve
            .iter()
            .fold(invocation.path_arg(in_file).produces(&seg), |inv, p| inv.produces(p));
        self.tools.run(&ctx, invocation).await?;

        let restored = if bias_corrected {
            Value::from(restored)
        } else {
            Value::Null
        };
        Ok(OperationOutput::new()
            .with_output("restored_image", restored)
            .with_output("partial_volume_files", pve)
            .with_output("tissue_class_map", seg))
    }
}

/// `flirt`: affine registration
pub struct Flirt {
    tools: FslTools,
    signature: Signature,
}

impl Flirt {
    pub const TYPE: &'static str = "fsl.flirt";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file"))
                .input(PortDefinition::required("reference"))
                .input(PortDefinition::optional("dof").with_default(12))
                .input(PortDefinition::optional("searchr_x").describe("[min, max] degrees"))
                .input(PortDefinition::optional("searchr_y").describe("[min, max] degrees"))
                .input(PortDefinition::optional("searchr_z").describe("[min, max] degrees"))
                .output(PortDefinition::output("out_file"))
                .output(PortDefinition::output("out_matrix_file")),
        }
    }
}

#[async_trait]
impl Operation for Flirt {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let reference = ctx.require_path("reference")?;
        let out_file = self.tools.output_file(&ctx.work_dir, in_file, "_flirt");
        let matrix = ctx
            .work_dir
            .join(format!("{}_flirt.mat", image_stem(in_file)));
        let dof = ctx.optional_i64("dof")?.unwrap_or(12);

        let mut invocation = self
            .tools
            .invocation("flirt", &ctx.work_dir)
            .arg("-in")
            .path_arg(in_file)
            .arg("-ref")
            .path_arg(reference)
            .arg("-out")
            .path_arg(&out_file)
            .arg("-omat")
            .path_arg(&matrix)
            .args(["-dof".to_string(), dof.to_string()]);
        for axis in ["x", "y", "z"] {
            if let Some(range) = numbers(&ctx, &format!("searchr_{}", axis), 2)? {
                invocation = invocation
                    .arg(format!("-searchr{}", axis))
                    .args(range.into_iter().map(number));
            }
        }
        self.tools
            .run(&ctx, invocation.produces(&out_file).produces(&matrix))
            .await?;

        Ok(OperationOutput::new()
            .with_output("out_file", out_file)
            .with_output("out_matrix_file", matrix))
    }
}

/// `fnirt`: non-linear registration
pub struct Fnirt {
    tools: FslTools,
    signature: Signature,
}

impl Fnirt {
    pub const TYPE: &'static str = "fsl.fnirt";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file"))
                .input(PortDefinition::required("ref_file"))
                .input(PortDefinition::optional("affine_file"))
                .input(PortDefinition::optional("config_file"))
                .input(PortDefinition::optional("field_file").describe("Write the warp field"))
                .output(PortDefinition::output("warped_file"))
                .output(PortDefinition::output("field_file")),
        }
    }
}

#[async_trait]
impl Operation for Fnirt {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let ref_file = ctx.require_path("ref_file")?;
        let warped = self.tools.output_file(&ctx.work_dir, in_file, "_warped");
        let field = self.tools.output_file(&ctx.work_dir, in_file, "_field");
        let want_field = ctx.flag("field_file")?;

        let mut invocation = self
            .tools
            .invocation("fnirt", &ctx.work_dir)
            .arg(format!("--in={}", in_file.display()))
            .arg(format!("--ref={}", ref_file.display()));
        if ctx.inputs.get("affine_file").is_some_and(|v| !v.is_null()) {
            let affine = ctx.require_path("affine_file")?;
            invocation = invocation.arg(format!("--aff={}", affine.display()));
        }
        if ctx.inputs.get("config_file").is_some_and(|v| !v.is_null()) {
            let config = ctx.require_path("config_file")?;
            invocation = invocation.arg(format!("--config={}", config.display()));
        }
        invocation = invocation
            .arg(format!("--iout={}", warped.display()))
            .produces(&warped);
        if want_field {
            invocation = invocation
                .arg(format!("--fout={}", field.display()))
                .produces(&field);
        }
        self.tools.run(&ctx, invocation).await?;

        let field = if want_field {
            Value::from(field)
        } else {
            Value::Null
        };
        Ok(OperationOutput::new()
            .with_output("warped_file", warped)
            .with_output("field_file", field))
    }
}

/// `invwarp`: invert a non-linear warp field
pub struct InvWarp {
    tools: FslTools,
    signature: Signature,
}

impl InvWarp {
    pub const TYPE: &'static str = "fsl.invwarp";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file").describe("Warp field to invert"))
                .input(PortDefinition::required("ref_file").describe("Image in the warp's input space"))
                .output(PortDefinition::output("out_file")),
        }
    }
}

#[async_trait]
impl Operation for InvWarp {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let warp = ctx.require_path("in_file")?;
        let ref_file = ctx.require_path("ref_file")?;
        let out_file = self.tools.output_file(&ctx.work_dir, warp, "_inverse");

        let invocation = self
            .tools
            .invocation("invwarp", &ctx.work_dir)
            .arg(format!("--warp={}", warp.display()))
            .arg(format!("--ref={}", ref_file.display()))
            .arg(format!("--out={}", out_file.display()))
            .produces(&out_file);
        self.tools.run(&ctx, invocation).await?;

        Ok(OperationOutput::new().with_output("out_file", out_file))
    }
}

/// `applywarp`: resample an image through a warp field
pub struct ApplyWarp {
    tools: FslTools,
    signature: Signature,
}

const INTERPOLATIONS: [&str; 4] = ["nn", "trilinear", "sinc", "spline"];

impl ApplyWarp {
    pub const TYPE: &'static str = "fsl.applywarp";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file"))
                .input(PortDefinition::required("ref_file"))
                .input(PortDefinition::optional("field_file"))
                .input(PortDefinition::optional("interp").describe("nn, trilinear, sinc or spline"))
                .output(PortDefinition::output("out_file")),
        }
    }
}

#[async_trait]
impl Operation for ApplyWarp {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let ref_file = ctx.require_path("ref_file")?;
        let out_file = self.tools.output_file(&ctx.work_dir, in_file, "_warp");

        let mut invocation = self
            .tools
            .invocation("applywarp", &ctx.work_dir)
            .arg(format!("--in={}", in_file.display()))
            .arg(format!("--ref={}", ref_file.display()))
            .arg(format!("--out={}", out_file.display()));
        if ctx.inputs.get("field_file").is_some_and(|v| !v.is_null()) {
            let field = ctx.require_path("field_file")?;
            invocation = invocation.arg(format!("--warp={}", field.display()));
        }
        if let Some(interp) = ctx.inputs.get("interp").filter(|v| !v.is_null()) {
            let interp = interp
                .as_str()
                .filter(|i| INTERPOLATIONS.contains(i))
                .ok_or_else(|| {
                    NodeError::Configuration(format!("unknown interpolation {}", interp.label()))
                })?;
            invocation = invocation.arg(format!("--interp={}", interp));
        }
        self.tools.run(&ctx, invocation.produces(&out_file)).await?;

        Ok(OperationOutput::new().with_output("out_file", out_file))
    }
}

/// `fslstats`: image statistics as numbers
pub struct ImageStats {
    tools: FslTools,
    signature: Signature,
}

impl ImageStats {
    pub const TYPE: &'static str = "fsl.image_stats";

    pub fn new(tools: FslTools) -> Self {
        Self {
            tools,
            signature: Signature::new()
                .input(PortDefinition::required("in_file"))
                .input(PortDefinition::required("op_string").describe("e.g. \"-V -M\""))
                .output(PortDefinition::output("out_stat")),
        }
    }
}

#[async_trait]
impl Operation for ImageStats {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn fingerprint(&self) -> Value {
        self.tools.fingerprint()
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let in_file = ctx.require_path("in_file")?;
        let op_string = ctx.require_input("op_string")?;
        let op_string = op_string.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "op_string".to_string(),
            expected: "string".to_string(),
            actual: op_string.type_name().to_string(),
        })?;

        ctx.events.info(format!("fslstats {} {}", in_file.display(), op_string));
        let mut stats = image_stats(&self.tools, in_file, op_string, &ctx.work_dir).await?;
        let out_stat = if stats.len() == 1 {
            Value::Number(stats.remove(0))
        } else {
            Value::from(stats)
        };

        Ok(OperationOutput::new().with_output("out_stat", out_stat))
    }
}

/// Factory shared by every FSL operation type
pub struct FslOperationFactory {
    operation_type: &'static str,
    description: &'static str,
    build: fn(FslTools) -> Arc<dyn Operation>,
    tools: FslTools,
}

impl FslOperationFactory {
    pub fn all(tools: &FslTools) -> Vec<Self> {
        let entry = |operation_type: &'static str,
                     description: &'static str,
                     build: fn(FslTools) -> Arc<dyn Operation>| Self {
            operation_type,
            description,
            build,
            tools: tools.clone(),
        };
        vec![
            entry(ExtractRoi::TYPE, "Extract a region of interest (fslroi)", |t| {
                Arc::new(ExtractRoi::new(t))
            }),
            entry(Bet::TYPE, "Brain extraction (bet)", |t| Arc::new(Bet::new(t))),
            entry(Fast::TYPE, "Tissue segmentation and bias correction (fast)", |t| {
                Arc::new(Fast::new(t))
            }),
            entry(Flirt::TYPE, "Affine registration (flirt)", |t| Arc::new(Flirt::new(t))),
            entry(Fnirt::TYPE, "Non-linear registration (fnirt)", |t| Arc::new(Fnirt::new(t))),
            entry(InvWarp::TYPE, "Invert a warp field (invwarp)", |t| Arc::new(InvWarp::new(t))),
            entry(ApplyWarp::TYPE, "Apply a warp field (applywarp)", |t| {
                Arc::new(ApplyWarp::new(t))
            }),
            entry(ImageStats::TYPE, "Image statistics (fslstats)", |t| {
                Arc::new(ImageStats::new(t))
            }),
        ]
    }
}

impl OperationFactory for FslOperationFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Arc<dyn Operation>, NodeError> {
        Ok((self.build)(self.tools.clone()))
    }

    fn operation_type(&self) -> &str {
        self.operation_type
    }

    fn metadata(&self) -> OperationMetadata {
        OperationMetadata {
            description: self.description.to_string(),
            category: "fsl".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcore::EventEmitter;
    use std::sync::Mutex;

    /// Records invocations and creates every declared output.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<ToolInvocation>>,
        stdout: String,
    }

    #[async_trait]
    impl ToolRunner for Recording {
        async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, NodeError> {
            for path in &invocation.produces {
                std::fs::write(path, b"img")?;
            }
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(ToolOutput {
                status: Some(0),
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    fn tools(runner: Arc<Recording>) -> FslTools {
        FslTools::new(
            runner,
            &ToolConfig {
                fsl_bin: PathBuf::from("/opt/fsl/bin"),
                output_type: OutputType::NiftiGz,
                renderer: PathBuf::from("render"),
            },
        )
    }

    fn ctx(work_dir: &Path, inputs: Vec<(&str, Value)>) -> OperationContext {
        OperationContext {
            node_name: "test".to_string(),
            instance: String::new(),
            inputs: inputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            work_dir: work_dir.to_path_buf(),
            events: EventEmitter::detached("test"),
        }
    }

    #[test]
    fn stems_drop_image_extensions() {
        assert_eq!(image_stem(Path::new("/d/P001_T13D.nii.gz")), "P001_T13D");
        assert_eq!(image_stem(Path::new("x.nii")), "x");
        assert_eq!(image_stem(Path::new("x_flirt.mat")), "x_flirt.mat");
    }

    #[tokio::test]
    async fn crop_box_becomes_fslroi_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recording::default());
        let op = ExtractRoi::new(tools(runner.clone()));
        let inputs = vec![
            ("in_file", Value::from("/d/P001_T13D.nii.gz")),
            ("x_min", Value::from(10)),
            ("x_size", Value::from(90)),
            ("y_min", Value::from(20)),
            ("y_size", Value::from(100)),
            ("z_min", Value::from(0)),
            ("z_size", Value::from(90)),
        ];

        let out = op.invoke(ctx(dir.path(), inputs)).await.unwrap();

        let roi = dir.path().join("P001_T13D_roi.nii.gz");
        assert_eq!(out.outputs["roi_file"], Value::from(roi.clone()));
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].program, PathBuf::from("/opt/fsl/bin/fslroi"));
        assert_eq!(seen[0].env["FSLOUTPUTTYPE"], "NIFTI_GZ");
        assert_eq!(&seen[0].args[2..], ["10", "90", "20", "100", "0", "90"]);
    }

    #[tokio::test]
    async fn volume_selection_defaults_t_min() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recording::default());
        let op = ExtractRoi::new(tools(runner.clone()));

        op.invoke(ctx(
            dir.path(),
            vec![("in_file", Value::from("/a/template_T1.nii.gz")), ("t_size", Value::from(1))],
        ))
        .await
        .unwrap();

        assert_eq!(&runner.seen.lock().unwrap()[0].args[2..], ["0", "1"]);
    }

    #[tokio::test]
    async fn partial_crop_box_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let op = ExtractRoi::new(tools(Arc::new(Recording::default())));
        let err = op
            .invoke(ctx(
                dir.path(),
                vec![("in_file", Value::from("/t.nii.gz")), ("x_min", Value::from(3))],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[tokio::test]
    async fn bet_passes_threshold_robust_and_center() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recording::default());
        let op = Bet::new(tools(runner.clone()));

        let out = op
            .invoke(ctx(
                dir.path(),
                vec![
                    ("in_file", Value::from("/w/P001_T13D_roi.nii.gz")),
                    ("frac", Value::from(0.2)),
                    ("robust", Value::from(true)),
                    ("center", Value::from(vec![64.0, 90.0, 55.5])),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(
            file_name(&out.outputs["out_file"]),
            "P001_T13D_roi_brain.nii.gz"
        );
        assert_eq!(
            &runner.seen.lock().unwrap()[0].args[2..],
            ["-f", "0.2", "-R", "-c", "64", "90", "55.5"]
        );
    }

    #[tokio::test]
    async fn fast_names_restore_and_partial_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let op = Fast::new(tools(Arc::new(Recording::default())));

        let out = op
            .invoke(ctx(
                dir.path(),
                vec![
                    ("in_files", Value::from("/w/P001_T13D_roi_brain.nii.gz")),
                    ("output_biascorrected", Value::from(true)),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(
            file_name(&out.outputs["restored_image"]),
            "P001_T13D_roi_brain_restore.nii.gz"
        );
        let pve: Vec<String> = out.outputs["partial_volume_files"]
            .as_array()
            .unwrap()
            .iter()
            .map(file_name)
            .collect();
        assert_eq!(
            pve,
            [
                "P001_T13D_roi_brain_pve_0.nii.gz",
                "P001_T13D_roi_brain_pve_1.nii.gz",
                "P001_T13D_roi_brain_pve_2.nii.gz"
            ]
        );
    }

    #[tokio::test]
    async fn flirt_writes_image_and_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recording::default());
        let op = Flirt::new(tools(runner.clone()));

        let out = op
            .invoke(ctx(
                dir.path(),
                vec![
                    ("in_file", Value::from("/w/x_restore.nii.gz")),
                    ("reference", Value::from("/w/template_T1_roi.nii.gz")),
                    ("searchr_x", Value::from(vec![-180, 180])),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(file_name(&out.outputs["out_matrix_file"]), "x_restore_flirt.mat");
        let args = runner.seen.lock().unwrap()[0].args.clone();
        assert!(args.windows(2).any(|w| w == ["-dof", "12"]));
        assert!(args.windows(3).any(|w| w == ["-searchrx", "-180", "180"]));
    }

    #[tokio::test]
    async fn applywarp_rejects_unknown_interpolation() {
        let dir = tempfile::tempdir().unwrap();
        let op = ApplyWarp::new(tools(Arc::new(Recording::default())));
        let err = op
            .invoke(ctx(
                dir.path(),
                vec![
                    ("in_file", Value::from("/m/wm_roi.nii.gz")),
                    ("ref_file", Value::from("/w/ref.nii.gz")),
                    ("interp", Value::from("cubic")),
                ],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[tokio::test]
    async fn image_stats_parses_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(Recording {
            stdout: "1000 1250.000000 0.800000 \n".to_string(),
            ..Default::default()
        });
        let op = ImageStats::new(tools(runner.clone()));

        let out = op
            .invoke(ctx(
                dir.path(),
                vec![("in_file", Value::from("/o/wm.nii.gz")), ("op_string", Value::from("-V -M"))],
            ))
            .await
            .unwrap();

        assert_eq!(out.outputs["out_stat"], Value::from(vec![1000.0, 1250.0, 0.8]));
        assert_eq!(&runner.seen.lock().unwrap()[0].args[1..], ["-V", "-M"]);
    }

    #[test]
    fn garbage_stats_output_is_an_operation_failure() {
        assert!(matches!(
            parse_stats("Image Exception : not found"),
            Err(NodeError::OperationFailed { .. })
        ));
        assert!(parse_stats("  ").is_err());
    }

    fn file_name(value: &Value) -> String {
        value
            .as_path()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
