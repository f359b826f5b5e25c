//! Host admission control
//!
//! Starting an emulator on an overloaded host produces containers that never
//! become healthy, so every container-create attempt first waits for the
//! 1-minute load average to drop to `1.5 × cores`. The wait is advisory: it
//! reduces contention between concurrent runs on one host but reserves nothing.

use crate::errors::{AdmissionError, Result};
use crate::progress::{ProgressEvent, ProgressTracker};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Samples taken before giving up (about half an hour at the default interval)
pub const MAX_SAMPLES: u32 = 30;
/// Delay between two load samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
/// Load average per core at which the host counts as idle
pub const LOAD_PER_CORE: f64 = 1.5;

/// Source of host load figures
pub trait LoadSampler: std::fmt::Debug {
    /// Current 1-minute load average
    fn load_average(&self) -> f64;
    /// Number of logical CPU cores
    fn cpu_cores(&self) -> usize;
}

/// Reads the real host load
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoadSampler;

impl LoadSampler for SystemLoadSampler {
    fn load_average(&self) -> f64 {
        sysinfo::System::load_average().one
    }

    fn cpu_cores(&self) -> usize {
        num_cpus::get().max(1)
    }
}

impl<T: LoadSampler> LoadSampler for std::sync::Arc<T> {
    fn load_average(&self) -> f64 {
        (**self).load_average()
    }

    fn cpu_cores(&self) -> usize {
        (**self).cpu_cores()
    }
}

/// Gates container creation on host CPU load
#[derive(Debug)]
pub struct AdmissionController {
    sampler: Box<dyn LoadSampler>,
    enabled: bool,
    max_samples: u32,
    sample_interval: Duration,
}

impl AdmissionController {
    /// Controller enabled on Linux hosts only.
    pub fn new(sampler: impl LoadSampler + 'static) -> Self {
        Self {
            sampler: Box::new(sampler),
            enabled: cfg!(target_os = "linux"),
            max_samples: MAX_SAMPLES,
            sample_interval: SAMPLE_INTERVAL,
        }
    }

    /// Controller reading the real host load.
    pub fn system() -> Self {
        Self::new(SystemLoadSampler)
    }

    /// Override platform detection.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Load average at or below which the host is considered idle.
    pub fn threshold(&self) -> f64 {
        self.sampler.cpu_cores() as f64 * LOAD_PER_CORE
    }

    /// Wait until the host is idle enough to start a container.
    ///
    /// Samples once, then once per interval, for at most [`MAX_SAMPLES`]
    /// samples. Fails with `ResourceTimeout` if the load never drops.
    #[instrument(skip(self, progress))]
    pub async fn wait_until_idle(&self, progress: &mut ProgressTracker) -> Result<()> {
        if !self.enabled {
            debug!("Admission control disabled on this platform");
            return Ok(());
        }

        let threshold = self.threshold();
        let mut last_load = 0.0;

        for sample in 1..=self.max_samples {
            let load = self.sampler.load_average();
            if load <= threshold {
                debug!("CPU load {:.2} within threshold {:.2}", load, threshold);
                return Ok(());
            }
            last_load = load;

            progress.emit(ProgressEvent::AdmissionWait {
                id: ProgressTracker::next_event_id(),
                timestamp: ProgressTracker::current_timestamp(),
                sample,
                load,
                threshold,
            });
            tokio::time::sleep(self.sample_interval).await;
        }

        warn!(
            "CPU stayed above {:.2} for {} samples",
            threshold, self.max_samples
        );
        Err(AdmissionError::ResourceTimeout {
            samples: self.max_samples,
            last_load,
            threshold,
        }
        .into())
    }
}

pub mod mock {
    //! Scripted load samples for tests

    use super::LoadSampler;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays load samples; the last one repeats.
    #[derive(Debug)]
    pub struct ScriptedLoad {
        cores: usize,
        loads: Mutex<VecDeque<f64>>,
        samples: Mutex<u32>,
    }

    impl ScriptedLoad {
        pub fn new(cores: usize, loads: impl IntoIterator<Item = f64>) -> Self {
            Self {
                cores,
                loads: Mutex::new(loads.into_iter().collect()),
                samples: Mutex::new(0),
            }
        }

        /// A host that is always idle.
        pub fn idle() -> Self {
            Self::new(4, [0.5])
        }

        /// Number of samples taken so far.
        pub fn samples(&self) -> u32 {
            *self.samples.lock().unwrap()
        }
    }

    impl LoadSampler for ScriptedLoad {
        fn load_average(&self) -> f64 {
            *self.samples.lock().unwrap() += 1;
            let mut loads = self.loads.lock().unwrap();
            if loads.len() > 1 {
                loads.pop_front().unwrap_or_default()
            } else {
                loads.front().copied().unwrap_or_default()
            }
        }

        fn cpu_cores(&self) -> usize {
            self.cores
        }
    }
}
