//! Port assignment and conflict resolution
//!
//! Concurrent runs on one host each publish the guest's remote display on a
//! host port derived from a per-instance factor. Nothing reserves that port, so
//! before creating a container we evict whatever still holds it.

use crate::errors::{ConfigError, Result};
use crate::executor::CommandExecutor;
use crate::runtime::RuntimeClient;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Absolute deadline of one HTTP probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Concrete host port derived from an instance factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub factor: Option<u16>,
    pub port: u16,
}

/// `base + factor` when a factor is configured, else `base`.
pub fn assign_port(base: u16, factor: Option<u16>) -> Result<PortBinding> {
    let port = match factor {
        Some(factor) => base.checked_add(factor).ok_or_else(|| ConfigError::Validation {
            message: format!("port factor {} pushes port {} past 65535", factor, base),
        })?,
        None => base,
    };
    Ok(PortBinding { factor, port })
}

/// Checks whether something answers on a local port
#[allow(async_fn_in_trait)]
pub trait PortProbe {
    async fn is_port_in_use(&self, port: u16) -> bool;
}

impl<T: PortProbe> PortProbe for &T {
    async fn is_port_in_use(&self, port: u16) -> bool {
        (*self).is_port_in_use(port).await
    }
}

/// Probes with an HTTP `HEAD`: any response means busy, any error means free
#[derive(Debug, Clone)]
pub struct HttpPortProbe {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
}

impl Default for HttpPortProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPortProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            host: "localhost".to_string(),
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl PortProbe for HttpPortProbe {
    async fn is_port_in_use(&self, port: u16) -> bool {
        let url = format!("http://{}:{}/", self.host, port);
        match self.client.head(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                debug!("{} answered with {}", url, response.status());
                true
            }
            Err(e) => {
                debug!("{} is free: {}", url, e);
                false
            }
        }
    }
}

/// Make `port` available for a new container.
///
/// Stops any running container publishing the port. If something still
/// answers there, waits one `interval` and force-removes the container named
/// `name` as a last resort; that last step is best effort.
#[instrument(skip(runtime, probe))]
pub async fn resolve_port_conflict<E, P>(
    runtime: &RuntimeClient<E>,
    probe: &P,
    port: u16,
    name: Option<&str>,
    interval: Duration,
) -> Result<()>
where
    E: CommandExecutor,
    P: PortProbe,
{
    if let Some(container) = runtime.find_container_publishing(port).await? {
        info!(
            "Port {} is published by container {}, stopping it",
            port,
            container.primary_name()
        );
        runtime.stop_container(Some(&container.id)).await?;
    }

    if !probe.is_port_in_use(port).await {
        return Ok(());
    }

    warn!("Port {} is still in use, removing the stale container", port);
    tokio::time::sleep(interval).await;
    if let Err(e) = runtime.stop_container(name).await {
        warn!("Stopping stale container failed: {}", e);
    }
    if let Err(e) = runtime.delete_container(name, true).await {
        warn!("Removing stale container failed: {}", e);
    }
    Ok(())
}

pub mod mock {
    //! Fixed port probe answers for tests

    use super::PortProbe;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays probe answers; the last one repeats, an empty script means free.
    #[derive(Debug, Default)]
    pub struct ScriptedProbe {
        answers: Mutex<VecDeque<bool>>,
        probes: Mutex<Vec<u16>>,
    }

    impl ScriptedProbe {
        pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().collect()),
                probes: Mutex::new(Vec::new()),
            }
        }

        /// A probe that always reports the port free.
        pub fn free() -> Self {
            Self::new([false])
        }

        /// Ports probed so far.
        pub fn probes(&self) -> Vec<u16> {
            self.probes.lock().unwrap().clone()
        }
    }

    impl PortProbe for ScriptedProbe {
        async fn is_port_in_use(&self, port: u16) -> bool {
            self.probes.lock().unwrap().push(port);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap_or_default()
            } else {
                answers.front().copied().unwrap_or_default()
            }
        }
    }
}
