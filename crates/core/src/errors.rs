//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (command execution, container runtime, admission control, provisioning,
//! guest setup, configuration) that are then wrapped in the main [`MangoError`] enum for
//! unified error handling.

use thiserror::Error;

/// Exit status for a run that completed normally.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status for a generic failure, including a failing task.
pub const EXIT_FAILURE: i32 = 1;

/// Exit status reserved for "the container never became healthy", so calling
/// automation can tell infrastructure trouble apart from a failing task.
pub const EXIT_INFRASTRUCTURE_UNAVAILABLE: i32 = 2;

/// Errors raised by the command execution primitive
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("Failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited with a non-zero status
    #[error("Command `{command}` failed with exit code {code}: {}", stderr.trim())]
    Failed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The program did not finish within its absolute deadline
    #[error("Command `{command}` timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    /// The blocking worker running the program went away
    #[error("Task join error: {0}")]
    Join(String),
}

impl CommandError {
    /// Whether the captured output of a failed command contains `needle`.
    pub fn output_contains(&self, needle: &str) -> bool {
        match self {
            CommandError::Failed { stdout, stderr, .. } => {
                stderr.contains(needle) || stdout.contains(needle)
            }
            _ => false,
        }
    }
}

/// Container runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// An operation needing a container identity ran before one existed
    #[error("Cannot {operation} because the container name is unknown")]
    UnknownContainer { operation: String },

    /// The runtime does not list a container we expected to exist
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// `docker run` produced no container identifier
    #[error("Container runtime returned no container id")]
    MissingContainerId,

    /// Runtime output could not be understood
    #[error("Failed to parse runtime output: {message}")]
    Parse { message: String },
}

/// Host admission control errors
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The host never became idle enough to start a container
    #[error("CPU was overloaded after {samples} samples (last load {last_load:.2}, threshold {threshold:.2}). Couldn't start emulator")]
    ResourceTimeout {
        samples: u32,
        last_load: f64,
        threshold: f64,
    },
}

/// Container provisioning errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The host cannot run accelerated emulators at all
    #[error("Linux requires GPU acceleration for running emulators, but KVM virtualization is not supported by your CPU (container {container})")]
    CapabilityUnavailable { container: String },

    /// The runtime never reported the container healthy within the budget
    #[error("Container {container} failed to become healthy within {timeout_secs}s (last status: {last_status})")]
    HealthCheckTimeout {
        container: String,
        timeout_secs: u64,
        last_status: String,
    },

    /// The guest never showed a fully attached device
    #[error("Newly created device in container {container} couldn't connect to adb")]
    ConnectivityFailure { container: String },

    /// Both the initial container and its single recreate failed to come up
    #[error("Infrastructure never became healthy after {attempts} attempts: {reason}")]
    InfrastructureUnavailable { attempts: u32, reason: String },
}

/// Guest configuration errors
#[derive(Error, Debug)]
pub enum GuestError {
    /// A locale tag that is not of the form `ll_CC`
    #[error("Invalid locale '{tag}', expected language_COUNTRY such as de_DE")]
    InvalidLocale { tag: String },

    /// A guest command printed something we cannot interpret
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum MangoError {
    /// Command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Container runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Admission control errors
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Provisioning errors
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Guest configuration errors
    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MangoError {
    /// Process exit status this error should surface as.
    pub fn exit_code(&self) -> i32 {
        match self {
            MangoError::Provision(ProvisionError::InfrastructureUnavailable { .. }) => {
                EXIT_INFRASTRUCTURE_UNAVAILABLE
            }
            _ => EXIT_FAILURE,
        }
    }

    /// Whether this is the runtime's storage-driver exhaustion failure.
    pub fn is_thin_pool_exhaustion(&self) -> bool {
        match self {
            MangoError::Command(err) => err.output_contains(crate::runtime::THIN_POOL_SIGNATURE),
            _ => false,
        }
    }
}

/// Convenience type alias for Results with MangoError
pub type Result<T> = std::result::Result<T, MangoError>;
