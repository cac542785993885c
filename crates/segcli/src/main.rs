// crates/segcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segcore::{ExecutionEvent, NodeEvent};
use segnodes::{FslTools, PipelineConfig, ProcessRunner, SegT1Pipeline};
use segruntime::{CancellationToken, OperationRegistry, PipelineRuntime, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "segt1")]
#[command(about = "Neonatal T1 brain segmentation", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the segmentation pipeline for one subject
    Run {
        /// Path to the pipeline JSON config
        #[arg(short, long)]
        config: PathBuf,

        /// Directory of the FSL binaries, overriding the config
        #[arg(long)]
        fsl_bin: Option<PathBuf>,

        /// Maximum number of node instances running at once
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Write the workflow graph as DOT and print it
    Graph {
        /// Path to the pipeline JSON config
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List available operation types
    Nodes,

    /// Create an example pipeline config
    Init {
        /// Output file path
        #[arg(short, long, default_value = "pipeline.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn load_config(path: &PathBuf, fsl_bin: Option<PathBuf>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)
        .with_context(|| format!("loading pipeline config {}", path.display()))?;
    if let Some(bin) = fsl_bin {
        config.tools.fsl_bin = bin;
    }
    Ok(config)
}

fn build_registry(tools: &FslTools) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    segnodes::register_all(&mut registry, tools);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            fsl_bin,
            max_parallel,
        } => {
            run_pipeline(load_config(&config, fsl_bin)?, max_parallel).await?;
        }

        Commands::Graph { config } => {
            show_graph(load_config(&config, None)?)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_config(output)?;
        }
    }

    Ok(())
}

async fn run_pipeline(config: PipelineConfig, max_parallel: Option<usize>) -> Result<()> {
    let started = Instant::now();
    println!("🧠 Segmenting {} (PCA {} weeks)", config.subject.pid, config.subject.pca);
    println!("   Parent dir: {}", config.subject.parent_dir.display());
    println!();

    let tools = FslTools::new(Arc::new(ProcessRunner), &config.tools);
    let registry = Arc::new(build_registry(&tools));
    let pipeline = SegT1Pipeline::build(config, &registry)?;

    let mut runtime_config = RuntimeConfig::default();
    if let Some(max) = max_parallel {
        runtime_config.max_parallel_nodes = max.max(1);
    }
    let runtime = PipelineRuntime::with_registry(registry, runtime_config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, letting running tools finish");
            on_interrupt.cancel();
        }
    });

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let outcome = pipeline
        .run_with_cancellation(&runtime, &tools, cancel)
        .await?;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let execution = &outcome.execution;
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.execution_id);
    println!(
        "   Instances: {} ({} reused from cache)",
        execution.instances.len(),
        execution.cached_count()
    );

    let finished = time_taken(started.elapsed());
    if !outcome.is_success() {
        for instance in execution.failed() {
            println!("   ❌ {}{}", instance.node, instance.label);
            if let Some(error) = &instance.error {
                println!("      {}", error);
            }
        }
        println!("{}", finished);
        anyhow::bail!("pipeline did not complete");
    }

    if let Some(metrics) = &outcome.metrics_file {
        println!("   Metrics: {}", metrics.display());
    }
    if let Some(image) = &outcome.image {
        println!("   Image: {}", image.display());
    }
    println!("{}", finished);

    Ok(())
}

/// Wall-clock minutes to seven significant digits
fn time_taken(elapsed: Duration) -> String {
    format!(
        "Time taken: {} minutes",
        segnodes::format_significant(elapsed.as_secs_f64() / 60.0, 7)
    )
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted {
            workflow, instances, ..
        } => {
            println!("▶️  Workflow {} started ({} instances)", workflow, instances);
        }
        ExecutionEvent::NodeStarted {
            node,
            instance,
            operation,
            ..
        } => {
            println!("  ⚡ Starting {}{} ({})", node, instance, operation);
        }
        ExecutionEvent::NodeCached { node, instance, .. } => {
            println!("  ♻️  {}{} reused cached result", node, instance);
        }
        ExecutionEvent::NodeCompleted {
            node,
            instance,
            duration_ms,
            ..
        } => {
            println!("  ✅ {}{} completed in {}ms", node, instance, duration_ms);
        }
        ExecutionEvent::NodeFailed {
            node,
            instance,
            error,
            ..
        } => {
            println!("  ❌ {}{} failed: {}", node, instance, error);
        }
        ExecutionEvent::NodeSkipped {
            node,
            instance,
            reason,
            ..
        } => {
            println!("  ⏭️  {}{} skipped: {}", node, instance, reason);
        }
        ExecutionEvent::NodeEvent {
            node,
            instance,
            event,
            ..
        } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}{}] {}", node, instance, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}{}] {}", node, instance, message);
            }
            NodeEvent::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}{}] {}% - {}", node, instance, percent, msg),
                None => println!("     📊 [{}{}] {}%", node, instance, percent),
            },
        },
        ExecutionEvent::WorkflowCompleted {
            success,
            duration_ms,
            ..
        } => {
            if success {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow failed after {}ms", duration_ms);
            }
        }
    }
}

fn show_graph(config: PipelineConfig) -> Result<()> {
    let tools = FslTools::new(Arc::new(ProcessRunner), &config.tools);
    let registry = build_registry(&tools);
    let pipeline = SegT1Pipeline::build(config, &registry)?;
    pipeline.graph().validate()?;

    let path = pipeline.graph().write_graph()?;
    println!("{}", pipeline.graph().to_dot());
    eprintln!("Wrote {}", path.display());
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Operation Types:");
    println!();

    let tools = FslTools::new(Arc::new(ProcessRunner), &Default::default());
    let registry = build_registry(&tools);

    for operation_type in registry.list_operation_types() {
        if let Some(metadata) = registry.get_metadata(&operation_type) {
            println!("  • {} ({})", operation_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", operation_type);
        }
    }
}

fn create_example_config(output: PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&PipelineConfig::example())?;
    std::fs::write(&output, json)?;

    println!("✨ Created example config: {}", output.display());
    println!();
    println!("Edit the subject and atlas paths, then run it with:");
    println!("  segt1 run --config {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_taken_uses_seven_significant_digits() {
        assert_eq!(time_taken(Duration::from_secs(90)), "Time taken: 1.5 minutes");
        assert_eq!(time_taken(Duration::from_secs(20)), "Time taken: 0.3333333 minutes");
        assert_eq!(time_taken(Duration::from_secs(7260)), "Time taken: 121.0 minutes");
    }
}
