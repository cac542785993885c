//! Pipeline configuration
//!
//! A single JSON document describes the subject, the neonatal atlas and
//! where the external tools live.

use crate::aggregate::Tissue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed pipeline config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid pipeline config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub subject: SubjectInfo,
    pub atlas: AtlasConfig,
    #[serde(default)]
    pub tools: ToolConfig,
}

/// Per-subject acquisition details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectInfo {
    /// Directory holding `<pid>_T13D.nii.gz`; all outputs go below it
    pub parent_dir: PathBuf,
    pub pid: String,
    /// Post-conceptional age in weeks
    pub pca: i64,
    /// x_min, x_max, y_min, y_max, z_min, z_max
    pub t1_crop_box: [i64; 6],
    /// Voxel coordinate used as the brain centre and the image strip centre
    pub t1_center: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    /// 4-D T1 template, one volume per age bucket
    pub template: PathBuf,
    /// Directory containing the tissue masks
    pub tissue_dir: PathBuf,
    pub fnirt_config: PathBuf,
}

impl AtlasConfig {
    /// Mask files shipped with the atlas, in output index order
    pub fn tissue_masks(&self) -> Vec<PathBuf> {
        Tissue::ALL
            .iter()
            .map(|t| self.tissue_dir.join(format!("{}.nii.gz", t.name())))
            .collect()
    }
}

/// Image format FSL tools write, exported as `FSLOUTPUTTYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputType {
    #[default]
    NiftiGz,
    Nifti,
}

impl OutputType {
    pub fn as_env(self) -> &'static str {
        match self {
            OutputType::NiftiGz => "NIFTI_GZ",
            OutputType::Nifti => "NIFTI",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputType::NiftiGz => ".nii.gz",
            OutputType::Nifti => ".nii",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Directory of the FSL binaries; empty means "search PATH"
    #[serde(default = "default_fsl_bin")]
    pub fsl_bin: PathBuf,
    #[serde(default)]
    pub output_type: OutputType,
    /// Program that renders the segmentation strip from a JSON description
    #[serde(default = "default_renderer")]
    pub renderer: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            fsl_bin: default_fsl_bin(),
            output_type: OutputType::default(),
            renderer: default_renderer(),
        }
    }
}

fn default_fsl_bin() -> PathBuf {
    std::env::var_os("FSLDIR")
        .map(|dir| PathBuf::from(dir).join("bin"))
        .unwrap_or_default()
}

fn default_renderer() -> PathBuf {
    PathBuf::from("segt1-render")
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.pid.trim().is_empty() {
            return Err(ConfigError::Invalid("subject.pid is empty".to_string()));
        }
        for (axis, pair) in ["x", "y", "z"].iter().zip(self.subject.t1_crop_box.chunks(2)) {
            if pair[1] <= pair[0] {
                return Err(ConfigError::Invalid(format!(
                    "t1_crop_box {} range is empty: {}..{}",
                    axis, pair[0], pair[1]
                )));
            }
        }
        if self.subject.pca <= 0 {
            return Err(ConfigError::Invalid(format!(
                "subject.pca must be positive, got {}",
                self.subject.pca
            )));
        }
        Ok(())
    }

    /// `<parent_dir>/SegT1/Outputs`
    pub fn outputs_dir(&self) -> PathBuf {
        self.subject.parent_dir.join("SegT1").join("Outputs")
    }

    /// Starting point written by `segt1 init`
    pub fn example() -> Self {
        Self {
            subject: SubjectInfo {
                parent_dir: PathBuf::from("/data/neonates/P001"),
                pid: "P001".to_string(),
                pca: 40,
                t1_crop_box: [20, 150, 10, 180, 0, 120],
                t1_center: [64.0, 90.0, 55.0],
            },
            atlas: AtlasConfig {
                template: PathBuf::from("res/NeonatalAtlas2/template_T1.nii.gz"),
                tissue_dir: PathBuf::from("res/NeonatalAtlas2"),
                fnirt_config: PathBuf::from("struct/FNIRTconfig.cnf"),
            },
            tools: ToolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pipeline.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_tool_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            r#"{
                "subject": {
                    "parent_dir": "/data/P001",
                    "pid": "P001",
                    "pca": 30,
                    "t1_crop_box": [10, 100, 20, 120, 0, 90],
                    "t1_center": [50.0, 60.0, 40.0]
                },
                "atlas": {
                    "template": "/atlas/template_T1.nii.gz",
                    "tissue_dir": "/atlas",
                    "fnirt_config": "/atlas/FNIRTconfig.cnf"
                }
            }"#,
        );

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.subject.pca, 30);
        assert_eq!(config.tools.output_type, OutputType::NiftiGz);
        assert_eq!(config.tools.renderer, PathBuf::from("segt1-render"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/data/P001/SegT1/Outputs"));
        assert_eq!(config.atlas.tissue_masks()[6], PathBuf::from("/atlas/brainmask.nii.gz"));
    }

    #[test]
    fn empty_crop_range_is_rejected() {
        let mut config = PipelineConfig::example();
        config.subject.t1_crop_box = [10, 10, 0, 5, 0, 5];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn output_type_uses_fsl_names() {
        let tools: ToolConfig =
            serde_json::from_str(r#"{"fsl_bin": "/opt/fsl/bin", "output_type": "NIFTI"}"#).unwrap();
        assert_eq!(tools.output_type.as_env(), "NIFTI");
        assert_eq!(tools.output_type.extension(), ".nii");
    }

    #[test]
    fn example_round_trips_through_json() {
        let text = serde_json::to_string_pretty(&PipelineConfig::example()).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&text).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
