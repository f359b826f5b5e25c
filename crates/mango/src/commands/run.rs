//! Run and up command implementations
//!
//! `mango run` provisions a container, runs the task in it, and always cleans
//! up. `mango up` only provisions and reports the container it left running.

use crate::cli::{CliContext, OutputFormat, TaskArgs};
use anyhow::Result;
use mango_core::admission::AdmissionController;
use mango_core::config::TaskConfig;
use mango_core::executor::ShellExecutor;
use mango_core::orchestrator::ContainerOrchestrator;
use mango_core::ports::HttpPortProbe;
use mango_core::progress::ProgressTracker;
use mango_core::runtime::RuntimeClient;
use mango_core::task::run_dockerized_task;
use serde::Serialize;
use tracing::{debug, instrument, warn};

/// Orchestrator driving real host processes
pub type HostOrchestrator = ContainerOrchestrator<ShellExecutor, HttpPortProbe>;

/// Executor for host commands, isolating docker credentials when configured.
pub fn host_executor(config: &TaskConfig) -> ShellExecutor {
    let executor = ShellExecutor::new();
    match &config.docker_config {
        Some(dir) => {
            debug!("Using docker config directory {}", dir.display());
            executor.with_env("DOCKER_CONFIG", dir.display().to_string())
        }
        None => executor,
    }
}

pub fn build_orchestrator(context: &CliContext, config: TaskConfig) -> Result<HostOrchestrator> {
    let runtime = RuntimeClient::with_runtime_path(host_executor(&config), &context.docker_path);
    let progress = ProgressTracker::for_file(context.progress_file.as_deref())?;
    Ok(ContainerOrchestrator::new(
        config,
        runtime,
        AdmissionController::system(),
        HttpPortProbe::new(),
        progress,
    ))
}

#[instrument(skip_all)]
pub async fn execute_run(context: &CliContext, task: &TaskArgs) -> Result<()> {
    let config = context.task_config(task)?;
    let mut orchestrator = build_orchestrator(context, config)?;
    run_dockerized_task(&mut orchestrator).await?;
    Ok(())
}

/// Result of `mango up`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpResult {
    outcome: &'static str,
    container_id: String,
    container_name: String,
    no_vnc_port: u16,
}

#[instrument(skip_all)]
pub async fn execute_up(
    context: &CliContext,
    task: &TaskArgs,
    output_format: OutputFormat,
) -> Result<()> {
    let config = context.task_config(task)?;
    let mut orchestrator = build_orchestrator(context, config)?;

    let handle = match orchestrator.setup_container().await {
        Ok(handle) => handle,
        Err(err) => {
            if let Err(cleanup_err) = orchestrator.cleanup().await {
                warn!("Cleanup after failed setup also failed: {}", cleanup_err);
            }
            return Err(err.into());
        }
    };

    let result = UpResult {
        outcome: "success",
        container_id: handle.id,
        container_name: handle.name,
        no_vnc_port: orchestrator.port(),
    };
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
        OutputFormat::Text => println!("{}", result.container_name),
    }
    Ok(())
}
