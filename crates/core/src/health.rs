//! Container health polling

use crate::errors::Result;
use crate::executor::CommandExecutor;
use crate::runtime::{ContainerState, RuntimeClient};
use std::time::Duration;
use tracing::{debug, instrument};

/// Health of a provisioned container as far as the runtime can tell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    /// Not inspected yet
    #[default]
    Unknown,
    /// Created but not reporting healthy yet
    Starting,
    Healthy,
    /// Declared health check failing, or the container is not running
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl From<&ContainerState> for HealthStatus {
    fn from(state: &ContainerState) -> Self {
        if state.is_healthy() {
            return HealthStatus::Healthy;
        }
        match state.describe() {
            "starting" | "created" | "restarting" => HealthStatus::Starting,
            "unhealthy" | "exited" | "dead" | "removing" | "paused" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Outcome of [`poll_healthy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPoll {
    pub status: HealthStatus,
    /// Raw runtime status of the last observation, for diagnostics
    pub last_status: String,
    pub checks: u64,
}

impl HealthPoll {
    pub fn healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

/// Poll the container's health for at most `timeout`.
///
/// Makes `timeout / interval` attempts (at least one). Each attempt sleeps half
/// an interval, inspects the container, and sleeps the other half if it is not
/// healthy yet. An inspect failure counts as not healthy.
#[instrument(skip(runtime))]
pub async fn poll_healthy<E: CommandExecutor>(
    runtime: &RuntimeClient<E>,
    container: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<HealthPoll> {
    let tries = if interval.is_zero() {
        1
    } else {
        (timeout.as_secs_f64() / interval.as_secs_f64()).floor().max(1.0) as u64
    };
    let half = interval / 2;
    let mut poll = HealthPoll {
        status: HealthStatus::Unknown,
        last_status: "unknown".to_string(),
        checks: 0,
    };

    for _ in 0..tries {
        tokio::time::sleep(half).await;
        poll.checks += 1;
        match runtime.inspect_state(container).await {
            Ok(state) => {
                poll.status = HealthStatus::from(&state);
                poll.last_status = state.describe().to_string();
            }
            Err(e) => {
                debug!("Inspecting {} failed: {}", container, e);
                poll.status = HealthStatus::Unknown;
                poll.last_status = e.to_string();
            }
        }
        if poll.healthy() {
            return Ok(poll);
        }
        tokio::time::sleep(interval - half).await;
    }

    Ok(poll)
}
