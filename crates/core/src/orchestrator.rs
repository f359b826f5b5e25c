//! Container lifecycle orchestration
//!
//! [`ContainerOrchestrator`] turns a [`TaskConfig`] into one healthy, ready
//! container: port assignment, eviction of stale containers, admission-gated
//! creation with a single retry, health polling with a single recreate, and
//! guest setup. Concurrent runs on one host coordinate only by detecting and
//! recovering from each other's leftovers; nothing here takes a lock.

use crate::admission::AdmissionController;
use crate::config::TaskConfig;
use crate::errors::{MangoError, ProvisionError, Result, RuntimeError};
use crate::executor::{host_shell, CommandExecutor};
use crate::guest::{CapabilityProbe, GuestConfigurator};
use crate::health::{poll_healthy, HealthStatus};
use crate::ports::{assign_port, resolve_port_conflict, PortProbe};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::runtime::{ContainerSummary, RuntimeClient, StartRequest};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Port the guest's remote display listens on inside the container
pub const GUEST_VNC_PORT: u16 = 6080;

/// Where the guest's supervisor keeps its logs
const SUPERVISOR_LOGS: &str = "tail -n 100 /var/log/supervisor/*.log";

/// Provisioning progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrchestratorState {
    #[default]
    Absent,
    PortAssigned,
    Creating,
    CapabilityChecked,
    HealthPolling,
    Healthy,
    Recreating,
    Configured,
    Ready,
    Failed,
}

/// The provisioned container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Full runtime id
    pub id: String,
    /// Configured name, or the id when none was configured
    pub name: String,
    pub health: HealthStatus,
}

/// Drives one container from nothing to ready, and tears it down again
#[derive(Debug)]
pub struct ContainerOrchestrator<E, P> {
    config: TaskConfig,
    runtime: RuntimeClient<E>,
    admission: AdmissionController,
    probe: P,
    progress: ProgressTracker,
    workspace: PathBuf,
    state: OrchestratorState,
    port: u16,
    handle: Option<ContainerHandle>,
}

impl<E: CommandExecutor, P: PortProbe> ContainerOrchestrator<E, P> {
    pub fn new(
        config: TaskConfig,
        runtime: RuntimeClient<E>,
        admission: AdmissionController,
        probe: P,
        progress: ProgressTracker,
    ) -> Self {
        let port = config.no_vnc_port;
        Self {
            config,
            runtime,
            admission,
            probe,
            progress,
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            state: OrchestratorState::Absent,
            port,
            handle: None,
        }
    }

    /// Host directory mounted into the container; the working directory by default.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeClient<E> {
        &self.runtime
    }

    pub fn progress(&mut self) -> &mut ProgressTracker {
        &mut self.progress
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Published remote-display port
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    pub fn container_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|handle| handle.name.as_str())
    }

    /// Take ownership of an existing container, e.g. to tear it down.
    pub fn adopt(&mut self, handle: ContainerHandle) {
        self.handle = Some(handle);
        self.state = OrchestratorState::Ready;
    }

    /// Provision a healthy, configured container.
    #[instrument(skip(self), fields(image = %self.config.docker_image))]
    pub async fn setup_container(&mut self) -> Result<ContainerHandle> {
        match self.provision().await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.state = OrchestratorState::Failed;
                self.progress.emit(ProgressEvent::ProvisionFailed {
                    id: ProgressTracker::next_event_id(),
                    timestamp: ProgressTracker::current_timestamp(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn provision(&mut self) -> Result<ContainerHandle> {
        let emulator = self.config.is_running_on_emulator;
        let configured_name = self.config.container_name.clone();
        if let Some(adb) = self.config.adb_path() {
            debug!("Host adb expected at {}", adb.display());
        }

        if emulator {
            if let Some(factor) = self.config.port_factor {
                self.assign_unique_port(factor).await?;
            }
        }

        if let Some(name) = configured_name.as_deref() {
            if self.runtime.find_container_by_name(name).await?.is_some() {
                info!("Removing existing container {}", name);
                self.runtime.delete_container(Some(name), true).await?;
            }
        }

        if emulator && self.config.vnc_enabled {
            resolve_port_conflict(
                &self.runtime,
                &self.probe,
                self.port,
                configured_name.as_deref(),
                self.config.poll_interval(),
            )
            .await?;
        }

        if self.config.pull_latest_image {
            self.pull_from_registry().await?;
        }

        self.runtime
            .disconnect_network_bridge(configured_name.as_deref())
            .await?;

        self.create_container().await?;

        if emulator {
            self.check_capability().await?;
        }

        if let Err(first) = self.await_ready().await {
            if !is_recoverable(&first) {
                return Err(first);
            }
            self.recreate(&first.to_string()).await?;

            if let Err(second) = self.await_ready().await {
                if !is_recoverable(&second) {
                    return Err(second);
                }
                self.dump_diagnostics().await;
                self.remove_container().await;
                return Err(ProvisionError::InfrastructureUnavailable {
                    attempts: 2,
                    reason: second.to_string(),
                }
                .into());
            }
        }

        let name = self.require_name()?.to_string();
        if emulator {
            let guest = GuestConfigurator::new(&self.runtime);
            guest.disable_animations(&name).await?;
            guest.increase_log_buffer(&name).await?;
        }
        self.state = OrchestratorState::Configured;

        if let Some(pre_action) = self.config.pre_action.clone() {
            info!("Running pre action in container {}", name);
            self.runtime
                .exec_in_container(Some(&name), &pre_action)
                .await?;
        }

        self.state = OrchestratorState::Ready;
        self.progress.emit(ProgressEvent::ContainerReady {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            container: name,
        });
        self.handle
            .clone()
            .ok_or_else(|| missing_container("finish setup"))
    }

    async fn assign_unique_port(&mut self, factor: u16) -> Result<()> {
        let binding = assign_port(self.config.no_vnc_port, Some(factor))?;
        self.port = binding.port;
        self.state = OrchestratorState::PortAssigned;
        self.progress.emit(ProgressEvent::PortAssigned {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            port: binding.port,
        });

        match self
            .runtime
            .executor()
            .run(&host_shell("hostname -I"))
            .await
        {
            Ok(output) => match output.split_whitespace().next() {
                Some(ip) => info!("Link to VNC: http://{}:{}", ip, binding.port),
                None => debug!("hostname -I printed no address"),
            },
            Err(e) => debug!("Could not determine host address: {}", e),
        }
        Ok(())
    }

    async fn pull_from_registry(&self) -> Result<()> {
        if let Some(login) = &self.config.docker_registry_login {
            info!("Logging in to the image registry");
            self.runtime.executor().run(&host_shell(login)).await?;
        }
        let image = self.config.docker_image.replace(":latest", "");
        self.runtime.pull_image(&image).await
    }

    /// Create the container, retrying once after a fixed pause.
    async fn create_container(&mut self) -> Result<()> {
        self.state = OrchestratorState::Creating;
        let name = self.config.container_name.clone();

        let id = match self.create_attempt(1).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    "Something went wrong while creating {}, will retry in {}s: {}",
                    name.as_deref().unwrap_or("the container"),
                    self.config.poll_interval,
                    err
                );
                if let Err(e) = self.runtime.stop_container(name.as_deref()).await {
                    debug!("Stopping partial container failed: {}", e);
                }
                if let Err(e) = self.runtime.delete_container(name.as_deref(), false).await {
                    debug!("Removing partial container failed: {}", e);
                }
                tokio::time::sleep(self.config.poll_interval()).await;
                self.create_attempt(2).await?
            }
        };

        let summary = self.resolve_container(&id).await?;
        self.handle = Some(ContainerHandle {
            id: summary.id,
            name: name.unwrap_or(id),
            health: HealthStatus::Unknown,
        });
        Ok(())
    }

    async fn create_attempt(&mut self, attempt: u32) -> Result<String> {
        self.admission.wait_until_idle(&mut self.progress).await?;

        self.progress.emit(ProgressEvent::ContainerCreateBegin {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            name: self.config.container_name.clone(),
            image: self.config.docker_image.clone(),
            attempt,
        });
        let result = self.runtime.start_container(&self.start_request()).await;
        self.progress.emit(ProgressEvent::ContainerCreateEnd {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            success: result.is_ok(),
            container_id: result.as_ref().ok().cloned(),
        });
        result
    }

    /// Arguments of `docker run` for the current configuration.
    pub fn start_request(&self) -> StartRequest {
        let mut extra_args = Vec::new();
        if self.config.is_running_on_emulator {
            extra_args.push("-p".to_string());
            extra_args.push(format!("{}:{}", self.port, GUEST_VNC_PORT));
            extra_args.push("-e".to_string());
            extra_args.push(format!("DEVICE={}", self.config.device_name));
        }
        for variable in &self.config.environment_variables {
            extra_args.push("-e".to_string());
            extra_args.push(variable.clone());
        }

        StartRequest {
            name: self.config.container_name.clone(),
            image: self.config.docker_image.clone(),
            core_limit: self.config.core_amount,
            extra_args,
            workspace: self.workspace.clone(),
        }
    }

    /// Look the new id up in the runtime listing, allowing it one interval to appear.
    async fn resolve_container(&self, id: &str) -> Result<ContainerSummary> {
        if let Some(summary) = self.runtime.find_container_by_id(id).await? {
            return Ok(summary);
        }
        debug!("Container {} not listed yet", id);
        tokio::time::sleep(self.config.poll_interval()).await;
        self.runtime
            .find_container_by_id(id)
            .await?
            .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() }.into())
    }

    async fn check_capability(&mut self) -> Result<()> {
        let name = self.require_name()?.to_string();
        let probe = GuestConfigurator::new(&self.runtime)
            .probe_virtualization(&name)
            .await?;
        match probe {
            CapabilityProbe::Supported => {}
            CapabilityProbe::Unsupported => {
                return Err(ProvisionError::CapabilityUnavailable { container: name }.into());
            }
            CapabilityProbe::Unknown(reason) => {
                warn!("Could not determine KVM support, continuing: {}", reason);
            }
        }
        self.state = OrchestratorState::CapabilityChecked;
        Ok(())
    }

    /// Poll runtime health, then guest connectivity in emulator mode.
    ///
    /// The handle only turns healthy once both checks passed.
    async fn await_ready(&mut self) -> Result<()> {
        self.state = OrchestratorState::HealthPolling;
        let (id, name) = match &self.handle {
            Some(handle) => (handle.id.clone(), handle.name.clone()),
            None => return Err(missing_container("poll container health")),
        };

        self.progress.emit(ProgressEvent::HealthWaitBegin {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            container: name.clone(),
            timeout_secs: self.config.container_timeout,
        });
        let poll = poll_healthy(
            &self.runtime,
            &id,
            self.config.container_timeout(),
            self.config.poll_interval(),
        )
        .await?;

        if !poll.healthy() {
            self.finish_health_wait(&name, poll.status);
            return Err(ProvisionError::HealthCheckTimeout {
                container: name,
                timeout_secs: self.config.container_timeout,
                last_status: poll.last_status,
            }
            .into());
        }

        if self.config.is_running_on_emulator {
            let connected = GuestConfigurator::new(&self.runtime)
                .wait_for_connection(&name)
                .await;
            match connected {
                Ok(true) => {}
                Ok(false) => {
                    self.finish_health_wait(&name, HealthStatus::Starting);
                    return Err(ProvisionError::ConnectivityFailure { container: name }.into());
                }
                Err(e) => {
                    self.finish_health_wait(&name, HealthStatus::Starting);
                    return Err(e);
                }
            }
        }

        self.finish_health_wait(&name, poll.status);
        self.state = OrchestratorState::Healthy;
        Ok(())
    }

    fn finish_health_wait(&mut self, name: &str, status: HealthStatus) {
        let healthy = status.is_healthy();
        if let Some(handle) = self.handle.as_mut() {
            handle.health = status;
        }
        self.progress.emit(ProgressEvent::HealthWaitEnd {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            container: name.to_string(),
            healthy,
        });
    }

    async fn recreate(&mut self, reason: &str) -> Result<()> {
        self.state = OrchestratorState::Recreating;
        let container = self
            .container_name()
            .unwrap_or("<unknown>")
            .to_string();
        self.progress.emit(ProgressEvent::ContainerRecreate {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            container,
            reason: reason.to_string(),
        });
        info!(
            "Will retry checking for a healthy container after {} seconds",
            self.config.poll_interval
        );

        self.remove_container().await;
        tokio::time::sleep(self.config.poll_interval()).await;
        self.create_container().await
    }

    /// Runtime and guest logs of a container that never came up.
    async fn dump_diagnostics(&self) {
        let Some(name) = self.container_name() else {
            return;
        };
        match self.runtime.container_logs(name).await {
            Ok(logs) => warn!("Container {} output:\n{}", name, logs.trim_end()),
            Err(e) => debug!("Could not read container logs: {}", e),
        }
        match self.runtime.exec_output(Some(name), SUPERVISOR_LOGS).await {
            Ok(output) => warn!("Guest supervisor logs:\n{}", output.combined().trim_end()),
            Err(e) => debug!("Could not read supervisor logs: {}", e),
        }
    }

    /// Stop and force-remove the current container, ignoring failures.
    async fn remove_container(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = self.runtime.stop_container(Some(&handle.name)).await {
            debug!("Stopping {} failed: {}", handle.name, e);
        }
        if let Err(e) = self.runtime.delete_container(Some(&handle.name), true).await {
            warn!("Removing {} failed: {}", handle.name, e);
        }
    }

    /// Run a command inside the provisioned container.
    pub async fn exec(&self, command: &str) -> Result<String> {
        self.runtime
            .exec_in_container(self.container_name(), command)
            .await
    }

    /// Stop and force-remove the container; does nothing before one exists.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            debug!("No container to clean up");
            return Ok(());
        };
        self.progress.emit(ProgressEvent::ContainerCleanup {
            id: ProgressTracker::next_event_id(),
            timestamp: ProgressTracker::current_timestamp(),
            container: handle.name.clone(),
        });

        if let Err(e) = self.runtime.stop_container(Some(&handle.name)).await {
            warn!("Stopping {} failed: {}", handle.name, e);
        }
        self.runtime
            .delete_container(Some(&handle.name), true)
            .await?;
        self.state = OrchestratorState::Absent;
        Ok(())
    }

    fn require_name(&self) -> Result<&str> {
        self.container_name()
            .ok_or_else(|| missing_container("configure the guest"))
    }
}

fn missing_container(operation: &str) -> MangoError {
    RuntimeError::UnknownContainer {
        operation: operation.to_string(),
    }
    .into()
}

/// Failures that a fresh container may cure.
fn is_recoverable(err: &MangoError) -> bool {
    matches!(
        err,
        MangoError::Provision(
            ProvisionError::HealthCheckTimeout { .. } | ProvisionError::ConnectivityFailure { .. }
        )
    )
}
