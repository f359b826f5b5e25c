//! Container runtime client
//!
//! One call per runtime operation, executed through the docker CLI via a
//! [`CommandExecutor`]. Container create and image pull are wrapped in the
//! thin-pool retry: the devicemapper storage driver can run out of space under
//! heavy concurrent use on a shared host and recovers after a prune.

use crate::errors::{MangoError, Result, RuntimeError};
use crate::executor::{argv, CommandExecutor, CommandOutput};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::future::Future;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Error text the runtime prints when its storage pool is exhausted
pub const THIN_POOL_SIGNATURE: &str = "Create more free space in thin pool";

/// Where the host workspace is mounted inside the container
pub const GUEST_WORKSPACE_MOUNT: &str = "/root/tests";

/// Failure texts meaning the container is already off the bridge network
const ALREADY_DISCONNECTED: [&str; 2] = ["is not connected to", "No such container"];

/// Host side of a binding such as `0.0.0.0:6080->6080/tcp` or
/// `0.0.0.0:6080-6090->6080-6090/tcp`
static PUBLISHED_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":(\d+)(?:-(\d+))?->").expect("published port pattern is valid")
});

/// One row of `docker ps --format '{{json .}}'`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    /// Comma-separated container names
    #[serde(rename = "Names", default)]
    pub names: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    /// Run state, e.g. `running` or `exited`
    #[serde(rename = "State", default)]
    pub state: String,
    /// Human readable status, e.g. `Up 2 minutes (healthy)`
    #[serde(rename = "Status", default)]
    pub status: String,
    /// Port bindings, e.g. `0.0.0.0:6080->6080/tcp`
    #[serde(rename = "Ports", default)]
    pub ports: String,
}

impl ContainerSummary {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names
            .split(',')
            .map(|name| name.trim().trim_start_matches('/'))
            .filter(|name| !name.is_empty())
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names().any(|candidate| candidate == name)
    }

    /// Host port ranges this container publishes; single ports are one-element ranges.
    pub fn published_ports(&self) -> Vec<RangeInclusive<u16>> {
        let mut ranges: Vec<RangeInclusive<u16>> = PUBLISHED_PORT
            .captures_iter(&self.ports)
            .filter_map(|caps| {
                let start: u16 = caps[1].parse().ok()?;
                let end: u16 = match caps.get(2) {
                    Some(end) => end.as_str().parse().ok()?,
                    None => start,
                };
                Some(start..=end)
            })
            .collect();
        ranges.dedup();
        ranges
    }

    /// Whether any published binding covers host `port`.
    pub fn publishes(&self, port: u16) -> bool {
        self.published_ports()
            .iter()
            .any(|range| range.contains(&port))
    }

    /// Whether `id` identifies this container (full id or either side a prefix).
    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty() && (self.id.starts_with(id) || id.starts_with(&self.id))
    }

    /// First listed name, falling back to the id.
    pub fn primary_name(&self) -> &str {
        self.names().next().unwrap_or(&self.id)
    }
}

/// Runtime-native health report
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    #[serde(rename = "Status")]
    pub status: String,
}

/// `State` section of `docker inspect`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ContainerState {
    /// Run state, e.g. `running`
    #[serde(rename = "Status")]
    pub status: String,
    /// Present only when the image declares a health check
    #[serde(rename = "Health", default)]
    pub health: Option<HealthReport>,
}

impl ContainerState {
    /// Healthy means a declared health check reports `healthy`, otherwise
    /// that the container is `running`.
    pub fn is_healthy(&self) -> bool {
        match &self.health {
            Some(report) => report.status == "healthy",
            None => self.status == "running",
        }
    }

    /// The status that decides health, for progress messages.
    pub fn describe(&self) -> &str {
        match &self.health {
            Some(report) => &report.status,
            None => &self.status,
        }
    }
}

/// Parameters of `docker run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Fixed container name; `--name` is only passed when set
    pub name: Option<String>,
    pub image: String,
    /// CPU quota; `--cpus` is only passed when positive
    pub core_limit: u32,
    /// Additional flags, each element one argument
    pub extra_args: Vec<String>,
    /// Host directory bind-mounted read-write at [`GUEST_WORKSPACE_MOUNT`]
    pub workspace: PathBuf,
}

/// docker CLI client
#[derive(Debug, Clone)]
pub struct RuntimeClient<E> {
    executor: E,
    runtime_path: String,
}

impl<E: CommandExecutor> RuntimeClient<E> {
    /// Client driving the `docker` binary.
    pub fn new(executor: E) -> Self {
        Self::with_runtime_path(executor, "docker")
    }

    /// Client driving a custom runtime binary.
    pub fn with_runtime_path(executor: E, runtime_path: impl Into<String>) -> Self {
        Self {
            executor,
            runtime_path: runtime_path.into(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    fn command<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![self.runtime_path.clone()];
        command.extend(argv(args));
        command
    }

    async fn docker<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.executor.run(&self.command(args)).await?)
    }

    async fn docker_output<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(self.executor.output(&self.command(args)).await?)
    }

    /// Run `block`; on thin-pool exhaustion prune once and run it once more.
    ///
    /// Any other error, or a second exhaustion, propagates unchanged.
    pub async fn with_thin_pool_retry<T, F, Fut>(&self, block: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match block().await {
            Err(err) if err.is_thin_pool_exhaustion() => {
                warn!("Container runtime storage is exhausted, pruning before retrying");
                if let Err(prune_err) = self.prune().await {
                    warn!("Storage prune failed: {}", prune_err);
                }
                block().await
            }
            other => other,
        }
    }

    #[instrument(skip(self))]
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);
        self.with_thin_pool_retry(|| self.docker(["pull", image]))
            .await
            .map(|_| ())
    }

    /// Create and start a detached privileged container, returning its id.
    #[instrument(skip(self))]
    pub async fn start_container(&self, request: &StartRequest) -> Result<String> {
        let mut args = vec![
            "run".to_string(),
            "-v".to_string(),
            format!("{}:{}", request.workspace.display(), GUEST_WORKSPACE_MOUNT),
            "--privileged".to_string(),
            "-t".to_string(),
            "-d".to_string(),
        ];
        if request.core_limit > 0 {
            args.push(format!("--cpus={}", request.core_limit));
        }
        args.extend(request.extra_args.iter().cloned());
        if let Some(name) = &request.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        args.push(request.image.clone());

        info!(
            "Attaching {} to the docker container",
            request.workspace.display()
        );
        let output = self.with_thin_pool_retry(|| self.docker(args.clone())).await?;

        // Pull progress may precede the id; the id is the last line.
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::MissingContainerId.into())
    }

    #[instrument(skip(self))]
    pub async fn stop_container(&self, name: Option<&str>) -> Result<()> {
        let Some(name) = name else {
            return Ok(());
        };
        self.docker(["stop", name]).await.map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn delete_container(&self, name: Option<&str>, force: bool) -> Result<()> {
        let Some(name) = name else {
            return Ok(());
        };
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);
        self.docker(args).await.map(|_| ())
    }

    /// Detach the container from the default bridge; already-detached is fine.
    #[instrument(skip(self))]
    pub async fn disconnect_network_bridge(&self, name: Option<&str>) -> Result<()> {
        let Some(name) = name else {
            return Ok(());
        };
        info!("Disconnecting {} from the network bridge", name);
        match self
            .docker(["network", "disconnect", "-f", "bridge", name])
            .await
        {
            Err(MangoError::Command(err))
                if ALREADY_DISCONNECTED
                    .iter()
                    .any(|needle| err.output_contains(needle)) =>
            {
                debug!("Network bridge for {} is already gone", name);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// Run a login-shell command inside the container and return its stdout.
    #[instrument(skip(self))]
    pub async fn exec_in_container(&self, name: Option<&str>, command: &str) -> Result<String> {
        let name = Self::require_name(name)?;
        self.docker(["exec", "-i", name, "bash", "-l", "-c", command])
            .await
    }

    /// Like [`exec_in_container`](Self::exec_in_container) but never fails on
    /// the command's exit status.
    pub async fn exec_output(&self, name: Option<&str>, command: &str) -> Result<CommandOutput> {
        let name = Self::require_name(name)?;
        self.docker_output(["exec", "-i", name, "bash", "-l", "-c", command])
            .await
    }

    pub async fn copy_into(&self, name: Option<&str>, source: &Path, dest: &str) -> Result<()> {
        let name = Self::require_name(name)?;
        let source = source.display().to_string();
        self.docker(["cp".to_string(), source, format!("{}:{}", name, dest)])
            .await
            .map(|_| ())
    }

    /// Last lines of the container's own output, stdout and stderr combined.
    pub async fn container_logs(&self, name: &str) -> Result<String> {
        let output = self.docker_output(["logs", "--tail", "200", name]).await?;
        Ok(output.combined())
    }

    pub async fn prune(&self) -> Result<()> {
        info!("Pruning unused container runtime data");
        self.docker(["system", "prune", "-f"]).await.map(|_| ())
    }

    /// Containers known to the runtime; `all` includes stopped ones.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps"];
        if all {
            args.push("-a");
        }
        args.extend(["--no-trunc", "--format", "{{json .}}"]);
        let output = self.docker(args).await?;
        parse_container_list(&output)
    }

    pub async fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerSummary>> {
        Ok(self
            .list_containers(true)
            .await?
            .into_iter()
            .find(|container| container.has_name(name)))
    }

    pub async fn find_container_by_id(&self, id: &str) -> Result<Option<ContainerSummary>> {
        Ok(self
            .list_containers(true)
            .await?
            .into_iter()
            .find(|container| container.matches_id(id)))
    }

    /// A running container publishing `port` on the host, if any.
    pub async fn find_container_publishing(&self, port: u16) -> Result<Option<ContainerSummary>> {
        Ok(self
            .list_containers(false)
            .await?
            .into_iter()
            .find(|container| container.publishes(port)))
    }

    pub async fn inspect_state(&self, id: &str) -> Result<ContainerState> {
        let output = self
            .docker(["inspect", "--format", "{{json .State}}", id])
            .await?;
        serde_json::from_str(output.trim()).map_err(|e| {
            RuntimeError::Parse {
                message: format!("container state of {}: {}", id, e),
            }
            .into()
        })
    }

    fn require_name(name: Option<&str>) -> Result<&str> {
        name.ok_or_else(|| {
            RuntimeError::UnknownContainer {
                operation: "execute docker command".to_string(),
            }
            .into()
        })
    }
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line.
pub fn parse_container_list(output: &str) -> Result<Vec<ContainerSummary>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                RuntimeError::Parse {
                    message: format!("container list: {}", e),
                }
                .into()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::ScriptedExecutor;

    const PS_ROW: &str = r#"{"ID":"abc123def456","Names":"t1","Image":"img:latest","State":"running","Status":"Up 2 minutes","Ports":"0.0.0.0:6083->6080/tcp, :::6083->6080/tcp"}"#;

    fn request(name: Option<&str>, core_limit: u32) -> StartRequest {
        StartRequest {
            name: name.map(str::to_string),
            image: "test-image".to_string(),
            core_limit,
            extra_args: Vec::new(),
            workspace: PathBuf::from("/work"),
        }
    }

    #[test]
    fn test_parse_container_list() {
        let containers = parse_container_list(&format!("{}\n\n", PS_ROW)).unwrap();
        assert_eq!(containers.len(), 1);
        let container = &containers[0];
        assert_eq!(container.primary_name(), "t1");
        assert!(container.has_name("t1"));
        assert_eq!(container.published_ports(), vec![6083..=6083]);
        assert!(container.publishes(6083));
        assert!(!container.publishes(6080));
        assert!(container.matches_id("abc123"));
        assert!(!container.matches_id(""));

        assert!(parse_container_list("").unwrap().is_empty());
        assert!(parse_container_list("not json").is_err());
    }

    #[test]
    fn test_container_state_health_rules() {
        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"running","Health":{"Status":"starting"}}"#).unwrap();
        assert!(!state.is_healthy());
        assert_eq!(state.describe(), "starting");

        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"running","Health":{"Status":"healthy"}}"#).unwrap();
        assert!(state.is_healthy());

        let state: ContainerState = serde_json::from_str(r#"{"Status":"running"}"#).unwrap();
        assert!(state.is_healthy());

        let state: ContainerState = serde_json::from_str(r#"{"Status":"created"}"#).unwrap();
        assert!(!state.is_healthy());
    }

    #[tokio::test]
    async fn test_start_container_without_core_limit_or_name() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok("docker run", "Pulling...\nabdef\n");
        let client = RuntimeClient::new(&executor);

        let id = client.start_container(&request(None, 0)).await.unwrap();
        assert_eq!(id, "abdef");
        assert_eq!(
            executor.invocations(),
            vec![argv([
                "docker",
                "run",
                "-v",
                "/work:/root/tests",
                "--privileged",
                "-t",
                "-d",
                "test-image"
            ])]
        );
    }

    #[tokio::test]
    async fn test_start_container_with_core_limit_and_name() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok("docker run", "abdef\n");
        let client = RuntimeClient::new(&executor);

        let mut req = request(Some("abcdef123"), 2);
        req.extra_args = argv(["-p", "6080:6080", "-e", "DEVICE=Nexus 5X"]);
        client.start_container(&req).await.unwrap();

        assert_eq!(
            executor.invocations(),
            vec![argv([
                "docker",
                "run",
                "-v",
                "/work:/root/tests",
                "--privileged",
                "-t",
                "-d",
                "--cpus=2",
                "-p",
                "6080:6080",
                "-e",
                "DEVICE=Nexus 5X",
                "--name",
                "abcdef123",
                "test-image"
            ])]
        );
    }

    #[tokio::test]
    async fn test_start_container_empty_output_is_an_error() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok("docker run", "\n");
        let client = RuntimeClient::new(&executor);

        let err = client.start_container(&request(None, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            MangoError::Runtime(RuntimeError::MissingContainerId)
        ));
    }

    #[tokio::test]
    async fn test_absent_name_operations_are_no_ops() {
        let executor = ScriptedExecutor::new();
        let client = RuntimeClient::new(&executor);

        client.stop_container(None).await.unwrap();
        client.delete_container(None, true).await.unwrap();
        client.disconnect_network_bridge(None).await.unwrap();
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_named_operations_issue_commands() {
        let executor = ScriptedExecutor::new();
        let client = RuntimeClient::new(&executor);

        client.stop_container(Some("abcdef123")).await.unwrap();
        client.delete_container(Some("abcdef123"), false).await.unwrap();
        client.delete_container(Some("abcdef123"), true).await.unwrap();
        client
            .disconnect_network_bridge(Some("abcdef123"))
            .await
            .unwrap();

        assert_eq!(
            executor.calls(),
            vec![
                "docker stop abcdef123",
                "docker rm abcdef123",
                "docker rm -f abcdef123",
                "docker network disconnect -f bridge abcdef123",
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_swallows_already_disconnected() {
        let executor = ScriptedExecutor::new();
        executor.respond_err(
            "network disconnect",
            1,
            "Error response from daemon: container abc is not connected to network bridge",
        );
        let client = RuntimeClient::new(&executor);
        assert!(client.disconnect_network_bridge(Some("abc")).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_propagates_other_failures() {
        let executor = ScriptedExecutor::new();
        executor.respond_err(
            "network disconnect",
            1,
            "Cannot connect to the Docker daemon",
        );
        let client = RuntimeClient::new(&executor);
        assert!(client.disconnect_network_bridge(Some("abc")).await.is_err());
    }

    #[tokio::test]
    async fn test_exec_requires_container_name() {
        let executor = ScriptedExecutor::new();
        let client = RuntimeClient::new(&executor);

        let err = client.exec_in_container(None, "adb devices").await.unwrap_err();
        assert!(matches!(
            err,
            MangoError::Runtime(RuntimeError::UnknownContainer { .. })
        ));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exec_runs_login_shell() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok("adb devices", "List of devices attached\n");
        let client = RuntimeClient::new(&executor);

        let stdout = client
            .exec_in_container(Some("t1"), "adb devices")
            .await
            .unwrap();
        assert_eq!(stdout, "List of devices attached\n");
        assert_eq!(
            executor.calls(),
            vec!["docker exec -i t1 bash -l -c 'adb devices'"]
        );
    }

    #[tokio::test]
    async fn test_thin_pool_retry_prunes_once_then_succeeds() {
        let executor = ScriptedExecutor::new();
        executor
            .respond_err("docker pull", 1, THIN_POOL_SIGNATURE)
            .respond_ok("docker pull", "done");
        let client = RuntimeClient::new(&executor);

        client.pull_image("bla").await.unwrap();
        assert_eq!(executor.count("docker system prune -f"), 1);
        assert_eq!(executor.count("docker pull bla"), 2);
    }

    #[tokio::test]
    async fn test_thin_pool_retry_reraises_second_exhaustion() {
        let executor = ScriptedExecutor::new();
        executor.respond_err("docker pull", 1, THIN_POOL_SIGNATURE);
        let client = RuntimeClient::new(&executor);

        let err = client.pull_image("bla").await.unwrap_err();
        assert!(err.is_thin_pool_exhaustion());
        assert_eq!(executor.count("docker system prune -f"), 1);
        assert_eq!(executor.count("docker pull bla"), 2);
    }

    #[tokio::test]
    async fn test_thin_pool_retry_ignores_other_errors() {
        let executor = ScriptedExecutor::new();
        executor.respond_err("docker run", 125, "invalid reference format");
        let client = RuntimeClient::new(&executor);

        assert!(client.start_container(&request(None, 0)).await.is_err());
        assert_eq!(executor.count("prune"), 0);
        assert_eq!(executor.count("docker run"), 1);
    }

    #[tokio::test]
    async fn test_find_container_publishing_uses_running_list() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok("docker ps --no-trunc", PS_ROW);
        let client = RuntimeClient::new(&executor);

        let found = client.find_container_publishing(6083).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some("abc123def456".to_string()));
        assert!(client.find_container_publishing(6080).await.unwrap().is_none());
        assert_eq!(executor.count("docker ps -a"), 0);
    }

    #[tokio::test]
    async fn test_find_container_publishing_port_range() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok(
            "docker ps --no-trunc",
            r#"{"ID":"f00d","Names":"farm","State":"running","Ports":"0.0.0.0:6080-6090->6080-6090/tcp"}"#,
        );
        let client = RuntimeClient::new(&executor);

        let found = client.find_container_publishing(6083).await.unwrap();
        assert_eq!(found.map(|c| c.id), Some("f00d".to_string()));
        assert!(client.find_container_publishing(6091).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inspect_state() {
        let executor = ScriptedExecutor::new();
        executor.respond_ok(
            "docker inspect",
            "{\"Status\":\"running\",\"Health\":{\"Status\":\"healthy\"}}\n",
        );
        let client = RuntimeClient::new(&executor);

        let state = client.inspect_state("abc").await.unwrap();
        assert!(state.is_healthy());
        assert_eq!(
            executor.invocations(),
            vec![argv(["docker", "inspect", "--format", "{{json .State}}", "abc"])]
        );
    }
}
