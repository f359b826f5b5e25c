//! Progress event streaming
//!
//! Structured progress events for each major provisioning transition. Events
//! are always mirrored to the log; a [`ProgressEmitter`] can additionally
//! stream them as JSON lines for calling automation.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Global event ID counter for deterministic ordering
pub static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Progress event types for provisioning phases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "port.assigned")]
    PortAssigned { id: u64, timestamp: u64, port: u16 },

    /// The host was too busy on one admission sample
    #[serde(rename = "admission.wait")]
    AdmissionWait {
        id: u64,
        timestamp: u64,
        sample: u32,
        load: f64,
        threshold: f64,
    },

    #[serde(rename = "container.create.begin")]
    ContainerCreateBegin {
        id: u64,
        timestamp: u64,
        name: Option<String>,
        image: String,
        attempt: u32,
    },
    #[serde(rename = "container.create.end")]
    ContainerCreateEnd {
        id: u64,
        timestamp: u64,
        success: bool,
        container_id: Option<String>,
    },

    #[serde(rename = "health.wait.begin")]
    HealthWaitBegin {
        id: u64,
        timestamp: u64,
        container: String,
        timeout_secs: u64,
    },
    #[serde(rename = "health.wait.end")]
    HealthWaitEnd {
        id: u64,
        timestamp: u64,
        container: String,
        healthy: bool,
    },

    /// The first container failed its health check and is being replaced
    #[serde(rename = "container.recreate")]
    ContainerRecreate {
        id: u64,
        timestamp: u64,
        container: String,
        reason: String,
    },

    #[serde(rename = "provision.failed")]
    ProvisionFailed {
        id: u64,
        timestamp: u64,
        reason: String,
    },

    #[serde(rename = "container.ready")]
    ContainerReady {
        id: u64,
        timestamp: u64,
        container: String,
    },

    #[serde(rename = "task.begin")]
    TaskBegin {
        id: u64,
        timestamp: u64,
        container: String,
    },
    #[serde(rename = "task.end")]
    TaskEnd {
        id: u64,
        timestamp: u64,
        container: String,
        success: bool,
    },

    #[serde(rename = "container.cleanup")]
    ContainerCleanup {
        id: u64,
        timestamp: u64,
        container: String,
    },
}

impl ProgressEvent {
    /// Returns the unique identifier for this event.
    pub fn id(&self) -> u64 {
        match self {
            ProgressEvent::PortAssigned { id, .. }
            | ProgressEvent::AdmissionWait { id, .. }
            | ProgressEvent::ContainerCreateBegin { id, .. }
            | ProgressEvent::ContainerCreateEnd { id, .. }
            | ProgressEvent::HealthWaitBegin { id, .. }
            | ProgressEvent::HealthWaitEnd { id, .. }
            | ProgressEvent::ContainerRecreate { id, .. }
            | ProgressEvent::ProvisionFailed { id, .. }
            | ProgressEvent::ContainerReady { id, .. }
            | ProgressEvent::TaskBegin { id, .. }
            | ProgressEvent::TaskEnd { id, .. }
            | ProgressEvent::ContainerCleanup { id, .. } => *id,
        }
    }

    /// Dotted event name as it appears in the JSON `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::PortAssigned { .. } => "port.assigned",
            ProgressEvent::AdmissionWait { .. } => "admission.wait",
            ProgressEvent::ContainerCreateBegin { .. } => "container.create.begin",
            ProgressEvent::ContainerCreateEnd { .. } => "container.create.end",
            ProgressEvent::HealthWaitBegin { .. } => "health.wait.begin",
            ProgressEvent::HealthWaitEnd { .. } => "health.wait.end",
            ProgressEvent::ContainerRecreate { .. } => "container.recreate",
            ProgressEvent::ProvisionFailed { .. } => "provision.failed",
            ProgressEvent::ContainerReady { .. } => "container.ready",
            ProgressEvent::TaskBegin { .. } => "task.begin",
            ProgressEvent::TaskEnd { .. } => "task.end",
            ProgressEvent::ContainerCleanup { .. } => "container.cleanup",
        }
    }
}

/// Trait for progress event emission
pub trait ProgressEmitter: Send + Sync + std::fmt::Debug {
    /// Emit a progress event
    fn emit(&mut self, event: &ProgressEvent) -> Result<()>;
}

/// JSON line emitter that writes to a file
#[derive(Debug)]
pub struct JsonFileEmitter {
    writer: BufWriter<File>,
}

impl JsonFileEmitter {
    /// Create an emitter appending JSONL events to `file_path`, creating
    /// parent directories as needed.
    pub fn new(file_path: &Path) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ProgressEmitter for JsonFileEmitter {
    fn emit(&mut self, event: &ProgressEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Silent emitter that discards all events
#[derive(Debug)]
pub struct SilentEmitter;

impl ProgressEmitter for SilentEmitter {
    fn emit(&mut self, _event: &ProgressEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory emitter, handy for asserting on emitted events
#[derive(Debug, Clone, Default)]
pub struct MemoryEmitter {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ProgressEvent::kind).collect()
    }
}

impl ProgressEmitter for MemoryEmitter {
    fn emit(&mut self, event: &ProgressEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// Progress event dispatcher
#[derive(Debug, Default)]
pub struct ProgressTracker {
    emitter: Option<Box<dyn ProgressEmitter>>,
}

impl ProgressTracker {
    /// Passing `None` disables external emission; events are still logged.
    pub fn new(emitter: Option<Box<dyn ProgressEmitter>>) -> Self {
        Self { emitter }
    }

    /// Tracker streaming to a JSONL file when a path is given.
    pub fn for_file(path: Option<&Path>) -> Result<Self> {
        let emitter: Option<Box<dyn ProgressEmitter>> = match path {
            Some(path) => Some(Box::new(JsonFileEmitter::new(path)?)),
            None => None,
        };
        Ok(Self::new(emitter))
    }

    /// Log the event and forward it to the emitter.
    ///
    /// Emission failures are logged and swallowed; progress reporting never
    /// aborts provisioning.
    pub fn emit(&mut self, event: ProgressEvent) {
        info!(target: "mango::progress", event = event.kind(), "{}", describe(&event));

        if let Some(ref mut emitter) = self.emitter {
            if let Err(e) = emitter.emit(&event) {
                warn!("Failed to emit progress event {}: {}", event.kind(), e);
            }
        }
    }

    /// Returns a unique event identifier and advances the global counter.
    pub fn next_event_id() -> u64 {
        EVENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since the Unix epoch; 0 if the clock is before it.
    pub fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::PortAssigned { port, .. } => format!("Port: {} was chosen for VNC", port),
        ProgressEvent::AdmissionWait { load, threshold, .. } => format!(
            "CPU load is: {:.2} (threshold {:.2}). Waiting for available resources..",
            load, threshold
        ),
        ProgressEvent::ContainerCreateBegin {
            name, attempt, ..
        } => format!(
            "Creating container: {} (attempt {})",
            name.as_deref().unwrap_or("<runtime-assigned>"),
            attempt
        ),
        ProgressEvent::ContainerCreateEnd {
            success,
            container_id,
            ..
        } => match (success, container_id) {
            (true, Some(id)) => format!("Container created: {}", id),
            _ => "Container creation failed".to_string(),
        },
        ProgressEvent::HealthWaitBegin {
            container,
            timeout_secs,
            ..
        } => format!(
            "Waiting up to {}s for container {} to be in the Healthy state",
            timeout_secs, container
        ),
        ProgressEvent::HealthWaitEnd {
            container, healthy, ..
        } => {
            if *healthy {
                format!("Container {} is ready to work", container)
            } else {
                format!("Container {} did not become healthy", container)
            }
        }
        ProgressEvent::ContainerRecreate {
            container, reason, ..
        } => format!("Recreating container {}: {}", container, reason),
        ProgressEvent::ProvisionFailed { reason, .. } => {
            format!("Container provisioning failed: {}", reason)
        }
        ProgressEvent::ContainerReady { container, .. } => {
            format!("Container {} is ready", container)
        }
        ProgressEvent::TaskBegin { container, .. } => {
            format!("Starting task in container {}", container)
        }
        ProgressEvent::TaskEnd {
            container, success, ..
        } => format!(
            "Task in container {} {}",
            container,
            if *success { "succeeded" } else { "failed" }
        ),
        ProgressEvent::ContainerCleanup { container, .. } => {
            format!("Cleaning up container {}", container)
        }
    }
}
