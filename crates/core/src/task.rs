//! Dockerized task runner
//!
//! Provisions the container, runs the configured task inside it, and always
//! runs post actions and cleanup afterwards, whatever happened before.

use crate::config::TaskConfig;
use crate::errors::Result;
use crate::executor::CommandExecutor;
use crate::guest::{GuestConfigurator, LocaleTag};
use crate::orchestrator::ContainerOrchestrator;
use crate::ports::PortProbe;
use crate::progress::{ProgressEvent, ProgressTracker};
use tracing::{info, instrument, warn};

/// Shell line running the task under its wall-clock budget.
pub fn task_command(config: &TaskConfig, task: &str) -> String {
    let bundle_install = if config.bundle_install {
        "&& bundle install "
    } else {
        ""
    };
    format!(
        "cd {} {}&& timeout {}m {} || exit 1",
        config.workspace_dir,
        bundle_install,
        config.task_time_budget_mins(),
        task
    )
}

/// Shell line running the post actions from the workspace.
pub fn post_actions_command(config: &TaskConfig, post_actions: &str) -> String {
    format!("cd {} && {}", config.workspace_dir, post_actions)
}

/// Set up the container, run the task, then run post actions and clean up.
///
/// Post actions are best effort. The first failure of setup or task is
/// returned; a cleanup failure is returned only when everything else passed.
#[instrument(skip(orchestrator))]
pub async fn run_dockerized_task<E, P>(orchestrator: &mut ContainerOrchestrator<E, P>) -> Result<()>
where
    E: CommandExecutor,
    P: PortProbe,
{
    let outcome = provision_and_run(orchestrator).await;

    if let Some(post_actions) = orchestrator.config().post_actions.clone() {
        if orchestrator.handle().is_some() {
            let command = post_actions_command(orchestrator.config(), &post_actions);
            if let Err(e) = orchestrator.exec(&command).await {
                warn!("Post actions failed: {}", e);
            }
        }
    }

    info!(
        "Cleaning up {} container",
        orchestrator.config().emulator_name
    );
    let cleanup = orchestrator.cleanup().await;

    match outcome {
        Ok(()) => cleanup,
        Err(err) => {
            if let Err(cleanup_err) = cleanup {
                warn!("Cleanup after failure also failed: {}", cleanup_err);
            }
            Err(err)
        }
    }
}

async fn provision_and_run<E, P>(orchestrator: &mut ContainerOrchestrator<E, P>) -> Result<()>
where
    E: CommandExecutor,
    P: PortProbe,
{
    let handle = orchestrator.setup_container().await?;
    let config = orchestrator.config().clone();

    if config.is_running_on_emulator {
        if let Some(language) = &config.emulator_language {
            let tag = LocaleTag::parse(language)?;
            GuestConfigurator::new(orchestrator.runtime())
                .set_locale(&handle.name, &tag, &config.settings_apk)
                .await?;
        }
    }

    let Some(task) = &config.android_task else {
        info!("No task configured");
        return Ok(());
    };

    info!("Starting Android Task");
    orchestrator.progress().emit(ProgressEvent::TaskBegin {
        id: ProgressTracker::next_event_id(),
        timestamp: ProgressTracker::current_timestamp(),
        container: handle.name.clone(),
    });
    let result = orchestrator.exec(&task_command(&config, task)).await;
    orchestrator.progress().emit(ProgressEvent::TaskEnd {
        id: ProgressTracker::next_event_id(),
        timestamp: ProgressTracker::current_timestamp(),
        container: handle.name,
        success: result.is_ok(),
    });
    result.map(|_| ())
}
