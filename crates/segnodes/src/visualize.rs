//! Composite segmentation image
//!
//! The picture itself is drawn by an external renderer. This module
//! assembles the layer description, writes it next to the target PNG and
//! runs the renderer on it.

use crate::aggregate::{AggregateError, Tissue, TissueLayout};
use crate::tool::{ToolInvocation, ToolRunner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Order the tissue layers are painted in, bottom first
pub const OVERLAY_ORDER: [Tissue; 6] = [
    Tissue::Csf,
    Tissue::Cortex,
    Tissue::Brainstem,
    Tissue::Cerebellum,
    Tissue::Dgm,
    Tissue::Wm,
];

pub const OVERLAY_WINDOW: (f64, f64) = (0.05, 1.0);
pub const OVERLAY_ALPHA: f64 = 0.7;
pub const STRIP_SLICES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub image: PathBuf,
    pub min: f64,
    pub max: f64,
    /// Name of the renderer's colour map
    pub colormap: String,
    pub alpha: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeImage {
    pub background: PathBuf,
    pub overlays: Vec<Overlay>,
}

/// Everything the renderer reads from its JSON argument
#[derive(Debug, Serialize, Deserialize)]
pub struct StripRequest {
    #[serde(flatten)]
    pub image: CompositeImage,
    pub center: [f64; 3],
    pub slices: usize,
    pub output: PathBuf,
}

impl CompositeImage {
    pub fn new(background: impl Into<PathBuf>) -> Self {
        Self {
            background: background.into(),
            overlays: Vec::new(),
        }
    }

    pub fn add_overlay(
        &mut self,
        image: impl Into<PathBuf>,
        min: f64,
        max: f64,
        colormap: impl Into<String>,
        alpha: f64,
    ) -> &mut Self {
        self.overlays.push(Overlay {
            image: image.into(),
            min,
            max,
            colormap: colormap.into(),
            alpha,
        });
        self
    }

    /// Bias-corrected background with the six tissue masks on top
    pub fn tissue_composite(layout: &TissueLayout) -> Result<Self, AggregateError> {
        let mut image = Self::new(TissueLayout::require(layout.bias_corrected())?);
        for tissue in OVERLAY_ORDER {
            let (min, max) = OVERLAY_WINDOW;
            image.add_overlay(
                TissueLayout::require(layout.mask(tissue))?,
                min,
                max,
                tissue.name(),
                OVERLAY_ALPHA,
            );
        }
        Ok(image)
    }

    /// Render a strip of `slices` slices centred on `center` into `output`.
    pub async fn save_strip(
        &self,
        center: [f64; 3],
        slices: usize,
        output: &Path,
        renderer: &Path,
        runner: &dyn ToolRunner,
    ) -> Result<PathBuf, AggregateError> {
        let work_dir = output.parent().unwrap_or(Path::new(".")).to_path_buf();
        tokio::fs::create_dir_all(&work_dir).await?;

        let request = StripRequest {
            image: self.clone(),
            center,
            slices,
            output: output.to_path_buf(),
        };
        let request_file = output.with_extension("json");
        tokio::fs::write(&request_file, serde_json::to_vec_pretty(&request)?).await?;

        let invocation = ToolInvocation::new(renderer, work_dir)
            .path_arg(&request_file)
            .produces(output);
        runner.run(&invocation).await.map_err(AggregateError::Render)?;

        tracing::info!("Saved segmentation image {}", output.display());
        Ok(output.to_path_buf())
    }
}
