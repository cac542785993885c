//! Result sink
//!
//! Materializes selected node outputs into a stable output tree once a run
//! has finished. Generated paths look like
//! `<category>/<iteration label>/_<map node><i>/<file>` and are rewritten by
//! an ordered list of substitutions before copying.

use crate::{ExecutionResult, InstanceState};
use regex::Regex;
use segcore::{FlowError, NodeId, NodeKind, PortDirection, Value, WorkflowError, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub enum Substitution {
    Literal { pattern: String, replacement: String },
    Regex { pattern: Regex, replacement: String },
}

impl Substitution {
    pub fn apply(&self, path: &str) -> String {
        match self {
            Substitution::Literal {
                pattern,
                replacement,
            } => path.replace(pattern.as_str(), replacement),
            Substitution::Regex {
                pattern,
                replacement,
            } => pattern.replace_all(path, replacement.as_str()).into_owned(),
        }
    }
}

#[derive(Debug, Clone)]
struct SinkEntry {
    node: NodeId,
    port: String,
    category: String,
}

pub struct DataSink {
    base_directory: PathBuf,
    entries: Vec<SinkEntry>,
    substitutions: Vec<Substitution>,
}

impl DataSink {
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            entries: Vec::new(),
            substitutions: Vec::new(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Route `node.port` into `category` of the output tree.
    pub fn sink(
        &mut self,
        graph: &WorkflowGraph,
        node: NodeId,
        port: impl Into<String>,
        category: impl Into<String>,
    ) -> Result<(), WorkflowError> {
        let port = port.into();
        let spec = graph.node(node)?;
        if !spec.operation.signature().has_output(&port) {
            return Err(WorkflowError::Port {
                node: spec.name.clone(),
                port,
                direction: PortDirection::Output,
            });
        }
        self.entries.push(SinkEntry {
            node,
            port,
            category: category.into(),
        });
        Ok(())
    }

    pub fn substitute(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.substitutions.push(Substitution::Literal {
            pattern: pattern.into(),
            replacement: replacement.into(),
        });
        self
    }

    pub fn substitute_regex(
        mut self,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        self.substitutions.push(Substitution::Regex {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        });
        Ok(self)
    }

    /// Apply every substitution in order, each to the previous result.
    pub fn rewrite(&self, relative: &str) -> String {
        self.substitutions
            .iter()
            .fold(relative.to_string(), |path, substitution| substitution.apply(&path))
    }

    /// Copy the outputs of every succeeded instance and write the manifest.
    pub async fn collect(
        &self,
        graph: &WorkflowGraph,
        result: &ExecutionResult,
    ) -> Result<SinkManifest, FlowError> {
        let mut manifest = SinkManifest::default();

        for entry in &self.entries {
            let spec = graph.node(entry.node)?;
            let instances = result
                .instances_of(&spec.name)
                .filter(|inst| inst.state == InstanceState::Succeeded);

            for instance in instances {
                let Some(value) = instance.outputs.get(&entry.port) else {
                    tracing::warn!("{}{} produced no '{}'", spec.name, instance.label, entry.port);
                    continue;
                };

                let mut prefix = entry.category.clone();
                if !instance.label.is_empty() {
                    prefix.push('/');
                    prefix.push_str(&instance.label);
                }

                let files: Vec<(Option<usize>, &Path)> = match (&spec.kind, value) {
                    (NodeKind::Map { .. }, Value::Array(items)) => items
                        .iter()
                        .enumerate()
                        .flat_map(|(i, item)| item.paths().into_iter().map(move |p| (Some(i), p)))
                        .collect(),
                    _ => value.paths().into_iter().map(|p| (None, p)).collect(),
                };

                for (index, source) in files {
                    let file_name = source
                        .file_name()
                        .ok_or_else(|| {
                            FlowError::Execution(format!(
                                "output '{}' of {} is not a file: {}",
                                entry.port,
                                spec.name,
                                source.display()
                            ))
                        })?
                        .to_string_lossy();
                    let relative = match index {
                        Some(i) => format!("{}/_{}{}/{}", prefix, spec.name, i, file_name),
                        None => format!("{}/{}", prefix, file_name),
                    };
                    let destination = self.base_directory.join(self.rewrite(&relative));

                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(source, &destination).await?;
                    tracing::debug!("Sinked {} -> {}", source.display(), destination.display());

                    manifest.entries.push(ManifestEntry {
                        category: entry.category.clone(),
                        node: spec.name.clone(),
                        iteration: instance.iteration.clone(),
                        index,
                        source: source.to_path_buf(),
                        destination,
                    });
                }
            }
        }

        manifest.write(&self.base_directory.join(MANIFEST_FILE)).await?;
        tracing::info!(
            "Sink wrote {} files under {}",
            manifest.entries.len(),
            self.base_directory.display()
        );
        Ok(manifest)
    }
}

/// Every file the sink materialized, with its semantic labels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkManifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub category: String,
    pub node: String,
    pub iteration: Vec<(String, Value)>,
    pub index: Option<usize>,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl SinkManifest {
    pub fn in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |e| e.category == category)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn write(&self, path: &Path) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, FlowError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutions_chain_in_declaration_order() {
        let sink = DataSink::new("/out")
            .substitute("_apply_T1_warp", "")
            .substitute("_roi_warp", "")
            .substitute("_pid_", "");

        assert_eq!(
            sink.rewrite("T1_Tissue_Classes/_pid_P001/_apply_T1_warp0/brainstem_roi_warp.nii.gz"),
            "T1_Tissue_Classes/P001/0/brainstem.nii.gz"
        );
    }

    #[test]
    fn later_rules_see_earlier_results() {
        let sink = DataSink::new("/out").substitute("abc", "xyz").substitute("xyz", "done");
        assert_eq!(sink.rewrite("abc"), "done");

        let reversed = DataSink::new("/out").substitute("xyz", "done").substitute("abc", "xyz");
        assert_eq!(reversed.rewrite("abc"), "xyz");
    }

    #[test]
    fn regex_substitutions_use_capture_groups() {
        let sink = DataSink::new("/out")
            .substitute_regex(r"_pve_(\d)", "_class$1")
            .unwrap();
        assert_eq!(sink.rewrite("Fast_PVE/x_pve_2.nii.gz"), "Fast_PVE/x_class2.nii.gz");
    }
}
