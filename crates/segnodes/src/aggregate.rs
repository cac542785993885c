//! Tissue volume metrics
//!
//! Reads the sink's output tree by convention:
//! `<outputs>/<contrast>_Tissue_Classes/<pid>/<index>/<tissue>.nii.gz` and
//! `<outputs>/<contrast>_Bias_Corrected/<pid>/<pid>_<contrast>_Bias_Corrected.nii.gz`.
//! A missing file is an error; the layout is never guessed.

use crate::fsl::{image_stats, FslTools};
use segcore::NodeError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const METRICS_FILE: &str = "Metrics.csv";
pub const METRICS_HEADER: &str = "Contrast,Brainstem,Cerebellum, Cortex, CSF, DGM, WM";

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Expected output is missing: {0}")]
    MissingFile(PathBuf),

    #[error("Statistics failed for {path}: {source}")]
    Stats {
        path: PathBuf,
        #[source]
        source: NodeError,
    },

    #[error("Rendering failed: {0}")]
    Render(NodeError),

    #[error("Unexpected statistics for {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Atlas tissue classes, in output index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tissue {
    Brainstem,
    Cerebellum,
    Cortex,
    Csf,
    Dgm,
    Wm,
    Brainmask,
}

impl Tissue {
    pub const ALL: [Tissue; 7] = [
        Tissue::Brainstem,
        Tissue::Cerebellum,
        Tissue::Cortex,
        Tissue::Csf,
        Tissue::Dgm,
        Tissue::Wm,
        Tissue::Brainmask,
    ];

    /// The classes that get a volume; the brain mask is only produced.
    pub const MEASURED: [Tissue; 6] = [
        Tissue::Brainstem,
        Tissue::Cerebellum,
        Tissue::Cortex,
        Tissue::Csf,
        Tissue::Dgm,
        Tissue::Wm,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Tissue::Brainstem => "brainstem",
            Tissue::Cerebellum => "cerebellum",
            Tissue::Cortex => "cortex",
            Tissue::Csf => "csf",
            Tissue::Dgm => "dgm",
            Tissue::Wm => "wm",
            Tissue::Brainmask => "brainmask",
        }
    }
}

/// Paths of one subject/contrast inside the output tree
#[derive(Debug, Clone)]
pub struct TissueLayout {
    outputs: PathBuf,
    pid: String,
    contrast: String,
}

impl TissueLayout {
    pub fn new(outputs: impl Into<PathBuf>, pid: impl Into<String>, contrast: impl Into<String>) -> Self {
        Self {
            outputs: outputs.into(),
            pid: pid.into(),
            contrast: contrast.into(),
        }
    }

    pub fn outputs(&self) -> &Path {
        &self.outputs
    }

    pub fn contrast(&self) -> &str {
        &self.contrast
    }

    pub fn mask(&self, tissue: Tissue) -> PathBuf {
        self.outputs
            .join(format!("{}_Tissue_Classes", self.contrast))
            .join(&self.pid)
            .join(tissue.index().to_string())
            .join(format!("{}.nii.gz", tissue.name()))
    }

    pub fn bias_corrected(&self) -> PathBuf {
        self.outputs
            .join(format!("{}_Bias_Corrected", self.contrast))
            .join(&self.pid)
            .join(format!("{}_{}_Bias_Corrected.nii.gz", self.pid, self.contrast))
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.outputs.join(METRICS_FILE)
    }

    pub fn segmentation_image(&self) -> PathBuf {
        self.outputs
            .join(format!("{}_{}_Segmentation.png", self.pid, self.contrast))
    }

    /// `path`, if it exists
    pub fn require(path: PathBuf) -> Result<PathBuf, AggregateError> {
        if path.is_file() {
            Ok(path)
        } else {
            Err(AggregateError::MissingFile(path))
        }
    }
}

/// Partial volume estimate: voxel count times mean of the non-zero voxels
pub fn volume(voxel_count: f64, mean_intensity: f64) -> f64 {
    voxel_count * mean_intensity
}

/// One metrics row: a contrast label and the six measured tissue volumes
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    pub label: String,
    pub volumes: [f64; 6],
}

impl VolumeRecord {
    pub fn volume_of(&self, tissue: Tissue) -> Option<f64> {
        Tissue::MEASURED
            .iter()
            .position(|t| *t == tissue)
            .map(|i| self.volumes[i])
    }

    pub fn csv_line(&self) -> String {
        self.volumes.iter().fold(self.label.clone(), |mut line, v| {
            let _ = write!(line, ",{}", format_significant(*v, 7));
            line
        })
    }
}

/// Measure every tissue mask of `layout` with `fslstats -V -M`.
pub async fn measure(layout: &TissueLayout, tools: &FslTools) -> Result<VolumeRecord, AggregateError> {
    let mut volumes = [0.0; 6];
    for (slot, tissue) in volumes.iter_mut().zip(Tissue::MEASURED) {
        let mask = TissueLayout::require(layout.mask(tissue))?;
        let work_dir = mask.parent().unwrap_or(layout.outputs()).to_path_buf();
        let stats = image_stats(tools, &mask, "-V -M", &work_dir)
            .await
            .map_err(|source| AggregateError::Stats {
                path: mask.clone(),
                source,
            })?;
        // -V prints voxels and mm³, -M the mean of non-zero voxels.
        let [voxels, _, mean] = stats[..] else {
            return Err(AggregateError::Malformed {
                path: mask,
                reason: format!("expected 3 values, got {:?}", stats),
            });
        };
        *slot = volume(voxels, mean);
        tracing::debug!("{} volume: {}", tissue.name(), slot);
    }

    Ok(VolumeRecord {
        label: layout.contrast().to_string(),
        volumes,
    })
}

/// Write the header and one line per record.
pub async fn write_metrics(path: &Path, records: &[VolumeRecord]) -> Result<(), AggregateError> {
    let body = records.iter().fold(format!("{}\n", METRICS_HEADER), |mut out, record| {
        out.push_str(&record.csv_line());
        out.push('\n');
        out
    });
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    tracing::info!("Wrote metrics to {}", path.display());
    Ok(())
}

/// `digits` significant digits in general notation, always keeping a
/// fractional digit in fixed notation: `800.0`, `1234.568`, `1.234568e+07`.
pub fn format_significant(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        let text = if value > 0.0 { "inf" } else { "-inf" };
        return text.to_string();
    }
    if value == 0.0 {
        let text = if value.is_sign_negative() { "-0.0" } else { "0.0" };
        return text.to_string();
    }

    let digits = digits.max(1);
    let scientific = format!("{:.*e}", digits - 1, value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (digits as i32 - 1 - exponent) as usize;
        let fixed = trim_fraction(&format!("{:.*}", decimals, value)).to_string();
        if fixed.contains('.') {
            fixed
        } else {
            fixed + ".0"
        }
    }
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
