//! Guest OS configuration
//!
//! Everything here runs inside the container through `docker exec`. The
//! configurator holds no state of its own; every operation takes the target
//! container name explicitly.

use crate::errors::{CommandError, GuestError, MangoError, ProvisionError, Result, RuntimeError};
use crate::executor::CommandExecutor;
use crate::retry::{retry_async, RetryDecision, RetryPolicy};
use crate::runtime::RuntimeClient;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Absolute deadline of each step of a locale change
pub const LOCALE_STEP_TIMEOUT: Duration = Duration::from_secs(60);
/// First API level without the custom-locale broadcast receiver
pub const SETTINGS_HELPER_MIN_API: u32 = 28;
/// Package of the settings helper used for locale changes
pub const SETTINGS_HELPER_PACKAGE: &str = "io.appium.settings";

const KVM_UNSUPPORTED: &str = "KVM acceleration can NOT be used";
const KVM_SUPPORTED: &str = "KVM acceleration can be used";

const ANIMATION_SETTINGS: [&str; 3] = [
    "window_animation_scale",
    "transition_animation_scale",
    "animator_duration_scale",
];

/// A guest locale such as `de_DE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleTag {
    pub language: String,
    pub country: String,
}

impl LocaleTag {
    /// Parse `ll_CC`; `ll-CC` is accepted as well.
    pub fn parse(tag: &str) -> Result<Self> {
        let invalid = || GuestError::InvalidLocale {
            tag: tag.to_string(),
        };
        let (language, country) = tag.trim().split_once(['_', '-']).ok_or_else(invalid)?;
        let well_formed = |part: &str| {
            (2..=3).contains(&part.len()) && part.chars().all(|c| c.is_ascii_alphanumeric())
        };
        if !well_formed(language) || !well_formed(country) {
            return Err(invalid().into());
        }
        Ok(Self {
            language: language.to_string(),
            country: country.to_string(),
        })
    }
}

impl fmt::Display for LocaleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.language, self.country)
    }
}

/// Outcome of the virtualization capability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityProbe {
    Supported,
    Unsupported,
    /// The probe could not decide; carries what it saw
    Unknown(String),
}

/// One-time guest setup and readiness probing
#[derive(Debug)]
pub struct GuestConfigurator<'a, E> {
    runtime: &'a RuntimeClient<E>,
    connection_policy: RetryPolicy,
    locale_policy: RetryPolicy,
    step_timeout: Duration,
}

impl<'a, E: CommandExecutor> GuestConfigurator<'a, E> {
    pub fn new(runtime: &'a RuntimeClient<E>) -> Self {
        Self {
            runtime,
            connection_policy: RetryPolicy::linear(5, Duration::from_secs(10)),
            locale_policy: RetryPolicy::fixed(5, Duration::from_secs(5)),
            step_timeout: LOCALE_STEP_TIMEOUT,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    #[instrument(skip(self))]
    pub async fn disable_animations(&self, name: &str) -> Result<()> {
        for setting in ANIMATION_SETTINGS {
            self.exec(
                name,
                &format!("adb shell settings put global {} 0.0", setting),
            )
            .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn increase_log_buffer(&self, name: &str) -> Result<()> {
        self.exec(name, "adb logcat -G 16m").await.map(|_| ())
    }

    /// Whether adb lists a fully attached device (not offline or unauthorized).
    pub async fn check_connectivity(&self, name: &str) -> Result<bool> {
        let devices = self.exec(name, "adb devices").await?;
        Ok(devices
            .lines()
            .any(|line| line.trim_end().ends_with("\tdevice")))
    }

    /// Probe connectivity with linear backoff until the device shows up.
    #[instrument(skip(self))]
    pub async fn wait_for_connection(&self, name: &str) -> Result<bool> {
        info!(
            "Checking if emulator is connected to ADB (waiting up to {}s)",
            self.connection_policy.worst_case_delay().as_secs()
        );
        let outcome = retry_async(
            &self.connection_policy,
            || async move {
                match self.check_connectivity(name).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ProvisionError::ConnectivityFailure {
                        container: name.to_string(),
                    }
                    .into()),
                    Err(e) => Err(e),
                }
            },
            stop_on_unknown_container,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!("Emulator connected successfully");
                Ok(true)
            }
            Err(e @ MangoError::Runtime(RuntimeError::UnknownContainer { .. })) => Err(e),
            Err(e) => {
                warn!("Newly created device couldn't connect to adb: {}", e);
                Ok(false)
            }
        }
    }

    /// Switch the guest locale, retrying the whole sequence on failure.
    #[instrument(skip(self), fields(locale = %tag))]
    pub async fn set_locale(&self, name: &str, tag: &LocaleTag, settings_apk: &Path) -> Result<()> {
        info!("Running tests in {}", tag);
        retry_async(
            &self.locale_policy,
            || self.apply_locale(name, tag, settings_apk),
            stop_on_unknown_container,
        )
        .await
    }

    async fn apply_locale(&self, name: &str, tag: &LocaleTag, settings_apk: &Path) -> Result<()> {
        let current = self
            .step(name, "adb shell getprop persist.sys.locale")
            .await?
            .trim()
            .replace('-', "_");
        if current == tag.to_string() {
            info!("Current device locale is already {}", tag);
            return Ok(());
        }

        info!("Changing device locale to {}", tag);
        let api_command = "adb shell getprop ro.build.version.sdk";
        let api_output = self.step(name, api_command).await?;
        let api: u32 = api_output
            .trim()
            .parse()
            .map_err(|_| GuestError::UnexpectedOutput {
                command: api_command.to_string(),
                output: api_output.trim().to_string(),
            })?;

        if api < SETTINGS_HELPER_MIN_API {
            self.step(
                name,
                &format!(
                    "adb shell am broadcast -a com.android.intent.action.SET_LOCALE --es com.android.intent.extra.LOCALE \"{}\" com.android.customlocale2",
                    tag
                ),
            )
            .await?;
            return Ok(());
        }

        debug!("API level {} needs the settings helper", api);
        let file_name = settings_apk
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings_apk-debug.apk".to_string());
        let guest_apk = format!("/tmp/{}", file_name);

        self.within(
            &format!("docker cp {}", settings_apk.display()),
            self.runtime
                .copy_into(Some(name), settings_apk, &guest_apk),
        )
        .await?;
        self.step(name, &format!("adb install -r {}", guest_apk))
            .await?;
        self.step(
            name,
            &format!(
                "adb shell pm grant {} android.permission.CHANGE_CONFIGURATION",
                SETTINGS_HELPER_PACKAGE
            ),
        )
        .await?;
        self.step(
            name,
            &format!(
                "adb shell am broadcast -a {pkg}.locale -n {pkg}/.receivers.LocaleSettingReceiver --es lang {} --es country {}",
                tag.language,
                tag.country,
                pkg = SETTINGS_HELPER_PACKAGE
            ),
        )
        .await?;
        Ok(())
    }

    /// Classify `kvm-ok` output.
    #[instrument(skip(self))]
    pub async fn probe_virtualization(&self, name: &str) -> Result<CapabilityProbe> {
        let output = match self.runtime.exec_output(Some(name), "kvm-ok").await {
            Ok(output) => output,
            Err(e @ MangoError::Runtime(_)) => return Err(e),
            Err(e) => return Ok(CapabilityProbe::Unknown(e.to_string())),
        };

        let text = output.combined();
        if text.contains(KVM_UNSUPPORTED) {
            Ok(CapabilityProbe::Unsupported)
        } else if text.contains(KVM_SUPPORTED) {
            Ok(CapabilityProbe::Supported)
        } else {
            Ok(CapabilityProbe::Unknown(format!(
                "kvm-ok exited with {}: {}",
                output.code,
                text.trim()
            )))
        }
    }

    async fn exec(&self, name: &str, command: &str) -> Result<String> {
        self.runtime.exec_in_container(Some(name), command).await
    }

    async fn step(&self, name: &str, command: &str) -> Result<String> {
        self.within(command, self.exec(name, command)).await
    }

    async fn within<T>(&self, command: &str, step: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.step_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::TimedOut {
                command: command.to_string(),
                seconds: self.step_timeout.as_secs(),
            }
            .into()),
        }
    }
}

fn stop_on_unknown_container(error: &MangoError) -> RetryDecision {
    match error {
        MangoError::Runtime(RuntimeError::UnknownContainer { .. }) => RetryDecision::Stop,
        _ => RetryDecision::Retry,
    }
}
