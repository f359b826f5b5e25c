use crate::commands;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mango_core::config::TaskConfig;
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Task options; each one overrides the same key of the configuration file
#[derive(Debug, Clone, Default, Args)]
pub struct TaskArgs {
    /// Name of the container; the runtime assigns one when absent
    #[arg(long, env = "CONTAINER_NAME")]
    pub container_name: Option<String>,
    /// Image to run
    #[arg(long, env = "DOCKER_IMAGE")]
    pub docker_image: Option<String>,
    /// Android device profile
    #[arg(long, env = "DEVICE_NAME")]
    pub device_name: Option<String>,
    /// Name of the Android emulator, used in messages
    #[arg(long, env = "EMULATOR_NAME")]
    pub emulator_name: Option<String>,
    /// Base port for noVNC
    #[arg(long, env = "NO_VNC_PORT")]
    pub no_vnc_port: Option<u16>,
    /// Offset added to the noVNC port, e.g. the CI executor number
    #[arg(long, env = "PORT_FACTOR")]
    pub port_factor: Option<u16>,
    /// Seconds to wait for a healthy container
    #[arg(long, env = "CONTAINER_TIMEOUT")]
    pub container_timeout: Option<u64>,
    /// Seconds between health checks
    #[arg(long, env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,
    /// CPU cores available to the container (0 = unlimited)
    #[arg(long, env = "CORE_AMOUNT")]
    pub core_amount: Option<u32>,
    /// Minutes the whole run may take
    #[arg(long, env = "MAXIMAL_RUN_TIME")]
    pub maximal_run_time: Option<u64>,
    /// Whether the image runs an Android emulator
    #[arg(long, env = "IS_RUNNING_ON_EMULATOR")]
    pub is_running_on_emulator: Option<bool>,
    /// Whether to free the noVNC port before starting
    #[arg(long, env = "VNC_ENABLED")]
    pub vnc_enabled: Option<bool>,
    /// Pull the image before creating the container
    #[arg(long, env = "PULL_LATEST_IMAGE")]
    pub pull_latest_image: Option<bool>,
    /// Host command logging in to the image registry
    #[arg(long, env = "DOCKER_REGISTRY_LOGIN")]
    pub docker_registry_login: Option<String>,
    /// Extra container environment variable (KEY=VAL, repeatable)
    #[arg(long = "env", env = "ENVIRONMENT_VARIABLES", value_delimiter = ',')]
    pub environment_variables: Vec<String>,
    /// Command run in the container before the task
    #[arg(long, env = "PRE_ACTION")]
    pub pre_action: Option<String>,
    /// Command run in the container after the task
    #[arg(long, env = "POST_ACTIONS")]
    pub post_actions: Option<String>,
    /// The task to run, e.g. a gradle invocation
    #[arg(long, env = "ANDROID_TASK")]
    pub android_task: Option<String>,
    /// Directory inside the container the task runs from
    #[arg(long, env = "WORKSPACE_DIR")]
    pub workspace_dir: Option<String>,
    /// Run `bundle install` before the task
    #[arg(long, env = "BUNDLE_INSTALL")]
    pub bundle_install: Option<bool>,
    /// Emulator locale, e.g. de_DE
    #[arg(long, env = "EMULATOR_LANGUAGE")]
    pub emulator_language: Option<String>,
    /// Settings helper package used to change the locale
    #[arg(long, env = "SETTINGS_APK", value_name = "PATH")]
    pub settings_apk: Option<PathBuf>,
    /// Android SDK root
    #[arg(long, env = "ANDROID_HOME", value_name = "PATH")]
    pub sdk_path: Option<PathBuf>,
    /// Docker credential directory for this run
    #[arg(long, env = "DOCKER_CONFIG", value_name = "PATH")]
    pub docker_config: Option<PathBuf>,
}

impl TaskArgs {
    /// Overlay the given options on `config`.
    pub fn apply(&self, config: &mut TaskConfig) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn set_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set_opt(&mut config.container_name, &self.container_name);
        set(&mut config.docker_image, &self.docker_image);
        set(&mut config.device_name, &self.device_name);
        set(&mut config.emulator_name, &self.emulator_name);
        set(&mut config.no_vnc_port, &self.no_vnc_port);
        set_opt(&mut config.port_factor, &self.port_factor);
        set(&mut config.container_timeout, &self.container_timeout);
        set(&mut config.poll_interval, &self.poll_interval);
        set(&mut config.core_amount, &self.core_amount);
        set(&mut config.maximal_run_time, &self.maximal_run_time);
        set(
            &mut config.is_running_on_emulator,
            &self.is_running_on_emulator,
        );
        set(&mut config.vnc_enabled, &self.vnc_enabled);
        set(&mut config.pull_latest_image, &self.pull_latest_image);
        set_opt(
            &mut config.docker_registry_login,
            &self.docker_registry_login,
        );
        if !self.environment_variables.is_empty() {
            config.environment_variables = self.environment_variables.clone();
        }
        set_opt(&mut config.pre_action, &self.pre_action);
        set_opt(&mut config.post_actions, &self.post_actions);
        set_opt(&mut config.android_task, &self.android_task);
        set(&mut config.workspace_dir, &self.workspace_dir);
        set(&mut config.bundle_install, &self.bundle_install);
        set_opt(&mut config.emulator_language, &self.emulator_language);
        set(&mut config.settings_apk, &self.settings_apk);
        set_opt(&mut config.sdk_path, &self.sdk_path);
        set_opt(&mut config.docker_config, &self.docker_config);
    }
}

/// mango subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision an emulator container, run the task in it, and clean up
    Run {
        #[command(flatten)]
        task: TaskArgs,
    },

    /// Provision an emulator container and leave it running
    Up {
        #[command(flatten)]
        task: TaskArgs,
        /// Output format for the provisioned container
        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Stop and remove a container
    Down {
        /// Name or id of the container
        #[arg(long)]
        name: String,
    },

    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        task: TaskArgs,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Dockerized Android emulator task runner",
    long_about = "Dockerized Android emulator task runner\n\nProvisions an Android emulator container, waits until it is healthy, runs a task inside it, and cleans up afterwards.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via MANGO_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (TOML)
    #[arg(long, global = true, value_name = "PATH", env = "MANGO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Progress file path (JSON lines)
    #[arg(long, global = true, value_name = "PATH")]
    pub progress_file: Option<PathBuf>,

    /// Path to docker executable
    #[arg(long, global = true, default_value = "docker")]
    pub docker_path: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Global options available to all subcommands
#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: Option<PathBuf>,
    pub progress_file: Option<PathBuf>,
    pub docker_path: String,
}

impl CliContext {
    /// Configuration file (or defaults) with `task` layered on top, validated.
    pub fn task_config(&self, task: &TaskArgs) -> Result<TaskConfig> {
        let mut config = match &self.config {
            Some(path) => TaskConfig::load_from_path(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TaskConfig::default(),
        };
        task.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };
        let log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        if std::env::var_os("MANGO_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var(
                "RUST_LOG",
                format!("mango={},mango_core={}", log_level, log_level),
            );
        }
        mango_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        let context = CliContext {
            config: self.config,
            progress_file: self.progress_file,
            docker_path: self.docker_path,
        };

        match self.command {
            Some(Commands::Run { task }) => commands::run::execute_run(&context, &task).await,
            Some(Commands::Up {
                task,
                output_format,
            }) => commands::run::execute_up(&context, &task, output_format).await,
            Some(Commands::Down { name }) => commands::down::execute_down(&context, &name).await,
            Some(Commands::Config { task }) => {
                let config = context.task_config(&task)?;
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            None => {
                println!("Dockerized Android emulator task runner");
                println!("Run 'mango --help' to see available commands.");
                Ok(())
            }
        }
    }
}
