use async_trait::async_trait;
use segcore::NodeError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// One command line of an external tool, plus the files it must leave behind
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: PathBuf,
    pub produces: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            work_dir: work_dir.into(),
            produces: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Declare a file the tool must create
    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces.push(path.into());
        self
    }

    /// Bare program name, used to label failures
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished tool
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Capability that executes external tools
///
/// Operations never spawn processes themselves, so tests can swap in a
/// runner that fabricates the expected files.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, NodeError>;
}

/// Runs tools as child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, NodeError> {
        let tool = invocation.tool_name();
        tracing::debug!("Running: {}", invocation.command_line());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .current_dir(&invocation.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            NodeError::operation_failed(&tool, None, format!("failed to spawn {}: {}", tool, e))
        })?;

        let result = ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(NodeError::operation_failed(
                tool,
                result.status,
                result.stderr.trim().to_string(),
            ));
        }
        if !result.stderr.trim().is_empty() {
            tracing::warn!("{} stderr: {}", tool, result.stderr.trim());
        }

        verify_outputs(invocation).await?;
        Ok(result)
    }
}

/// Fail when a declared output file is absent after a successful exit.
pub async fn verify_outputs(invocation: &ToolInvocation) -> Result<(), NodeError> {
    for path in &invocation.produces {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(NodeError::operation_failed(
                invocation.tool_name(),
                Some(0),
                format!("expected output missing: {}", path.display()),
            ));
        }
    }
    Ok(())
}
