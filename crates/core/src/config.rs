//! Task configuration
//!
//! [`TaskConfig`] is supplied once per run and never mutated afterwards. It can
//! be read from a TOML file; every key is optional and falls back to the
//! defaults below. The CLI layers flags and environment variables on top.

use crate::errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default emulator image
pub const DEFAULT_DOCKER_IMAGE: &str = "butomo1989/docker-android-x86-5.1.1";
/// Default guest device profile
pub const DEFAULT_DEVICE_NAME: &str = "Nexus 5X";
/// Default emulator serial used in messages
pub const DEFAULT_EMULATOR_NAME: &str = "emulator-5554";
/// Base port for the remote display; the guest always listens here
pub const DEFAULT_NO_VNC_PORT: u16 = 6080;
/// Default health-poll budget in seconds
pub const DEFAULT_CONTAINER_TIMEOUT_SECS: u64 = 450;
/// Default health-poll cadence in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
/// Default task budget in minutes
pub const DEFAULT_MAXIMAL_RUN_TIME_MINS: u64 = 60;
/// Minutes reserved for post actions and cleanup out of the task budget
pub const FAILURE_BUFFER_MINS: u64 = 5;
/// Default task working directory inside the guest
pub const DEFAULT_WORKSPACE_DIR: &str = "/root/tests/";
/// Default path of the locale helper package
pub const DEFAULT_SETTINGS_APK: &str = "../settings_apk/settings_apk-debug.apk";

/// Immutable configuration of one dockerized task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// Fixed container name; the runtime-assigned id is used when absent
    pub container_name: Option<String>,
    /// Image reference to run
    pub docker_image: String,
    /// Guest device profile passed as `DEVICE`
    pub device_name: String,
    /// Emulator serial, used in progress messages
    pub emulator_name: String,
    /// Base published port for the remote display
    pub no_vnc_port: u16,
    /// Offset added to the base port for per-instance uniqueness
    pub port_factor: Option<u16>,
    /// Health-poll budget in seconds
    pub container_timeout: u64,
    /// Health-poll cadence in seconds, also the sleep between create retries
    pub poll_interval: u64,
    /// CPU quota; 0 means unlimited
    pub core_amount: u32,
    /// Task budget in minutes
    pub maximal_run_time: u64,
    /// Gates every emulator-specific step
    pub is_running_on_emulator: bool,
    /// Gates port-conflict resolution
    pub vnc_enabled: bool,
    /// Pull the image before creating the container
    pub pull_latest_image: bool,
    /// Host command run before pulling
    pub docker_registry_login: Option<String>,
    /// Extra `KEY=VAL` environment variables for the container
    pub environment_variables: Vec<String>,
    /// Command run inside the container once it is ready
    pub pre_action: Option<String>,
    /// Command run inside the container after the task
    pub post_actions: Option<String>,
    /// The task command
    pub android_task: Option<String>,
    /// Task working directory inside the guest
    pub workspace_dir: String,
    /// Run `bundle install` before the task
    pub bundle_install: bool,
    /// Guest locale as `ll_CC`
    pub emulator_language: Option<String>,
    /// Locale helper package on the host
    pub settings_apk: PathBuf,
    /// Local Android SDK root
    pub sdk_path: Option<PathBuf>,
    /// Docker credential directory for this run
    pub docker_config: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            container_name: None,
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            emulator_name: DEFAULT_EMULATOR_NAME.to_string(),
            no_vnc_port: DEFAULT_NO_VNC_PORT,
            port_factor: None,
            container_timeout: DEFAULT_CONTAINER_TIMEOUT_SECS,
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            core_amount: 0,
            maximal_run_time: DEFAULT_MAXIMAL_RUN_TIME_MINS,
            is_running_on_emulator: true,
            vnc_enabled: true,
            pull_latest_image: false,
            docker_registry_login: None,
            environment_variables: Vec::new(),
            pre_action: None,
            post_actions: None,
            android_task: None,
            workspace_dir: DEFAULT_WORKSPACE_DIR.to_string(),
            bundle_install: false,
            emulator_language: None,
            settings_apk: PathBuf::from(DEFAULT_SETTINGS_APK),
            sdk_path: None,
            docker_config: None,
        }
    }
}

impl TaskConfig {
    /// Load a configuration file, falling back to defaults for missing keys.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading task configuration from {}", path.display());
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |message: String| -> Result<()> { Err(ConfigError::Validation { message }.into()) };

        if self.docker_image.trim().is_empty() {
            return invalid("docker_image must not be empty".to_string());
        }
        if self.poll_interval == 0 {
            return invalid("poll_interval must be at least 1 second".to_string());
        }
        if self.container_timeout < self.poll_interval {
            return invalid(format!(
                "container_timeout ({}s) must be at least one poll interval ({}s)",
                self.container_timeout, self.poll_interval
            ));
        }
        if self.maximal_run_time <= FAILURE_BUFFER_MINS {
            return invalid(format!(
                "maximal_run_time must exceed the {} minute failure buffer",
                FAILURE_BUFFER_MINS
            ));
        }
        if let Some(factor) = self.port_factor {
            if self.no_vnc_port.checked_add(factor).is_none() {
                return invalid(format!(
                    "port_factor {} pushes no_vnc_port {} past 65535",
                    factor, self.no_vnc_port
                ));
            }
        }
        for entry in &self.environment_variables {
            match entry.split_once('=') {
                Some((key, _)) if !key.is_empty() && !key.contains(char::is_whitespace) => {}
                _ => return invalid(format!("environment variable '{}' is not KEY=VAL", entry)),
            }
        }
        if let Some(tag) = &self.emulator_language {
            crate::guest::LocaleTag::parse(tag)?;
        }
        Ok(())
    }

    pub fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.container_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Minutes the task itself may run before its timeout wrapper kills it.
    pub fn task_time_budget_mins(&self) -> u64 {
        self.maximal_run_time.saturating_sub(FAILURE_BUFFER_MINS)
    }

    /// Path of the local adb binary, when an SDK root is known.
    pub fn adb_path(&self) -> Option<PathBuf> {
        self.sdk_path
            .as_ref()
            .map(|sdk| sdk.join("platform-tools").join("adb"))
    }
}
