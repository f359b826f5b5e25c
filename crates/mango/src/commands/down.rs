//! Down command implementation
//!
//! Stops and removes a container left behind by `mango up` or an interrupted run.

use crate::cli::{CliContext, TaskArgs};
use crate::commands::run::build_orchestrator;
use anyhow::Result;
use mango_core::health::HealthStatus;
use mango_core::orchestrator::ContainerHandle;
use tracing::{info, instrument};

#[instrument(skip(context))]
pub async fn execute_down(context: &CliContext, name: &str) -> Result<()> {
    let config = context.task_config(&TaskArgs::default())?;
    let mut orchestrator = build_orchestrator(context, config)?;

    let runtime = orchestrator.runtime();
    let found = match runtime.find_container_by_name(name).await? {
        Some(container) => Some(container),
        None => runtime.find_container_by_id(name).await?,
    };
    let Some(container) = found else {
        info!("No container named {}", name);
        return Ok(());
    };

    orchestrator.adopt(ContainerHandle {
        name: container.primary_name().to_string(),
        id: container.id,
        health: HealthStatus::Unknown,
    });
    orchestrator.cleanup().await?;
    info!("Container {} removed", name);
    Ok(())
}
