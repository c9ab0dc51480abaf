//! Background sampling of coarse host load and memory.
//!
//! The sampler keeps a sliding window of [`Sample`]s. Each tick appends one
//! sample and prunes everything older than the window, measured from the
//! sample just taken, under a single write lock so readers never see a
//! half-updated buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{SamplerConfig, format_duration};

/// One reading of host metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Unix seconds
    pub time: i64,
    /// One-minute load average
    pub cpu_load: f64,
    pub free_memory_bytes: u64,
}

/// Source of raw metric readings
pub trait MetricsProbe: Send + 'static {
    /// Current `(load average, free memory bytes)`
    fn read(&mut self) -> (f64, u64);
}

/// Probe backed by `sysinfo`
pub struct SystemProbe {
    sys: System,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
        );
        Self { sys }
    }
}

impl MetricsProbe for SystemProbe {
    fn read(&mut self) -> (f64, u64) {
        self.sys.refresh_memory();
        (System::load_average().one, self.sys.free_memory())
    }
}

pub struct Sampler {
    interval: Duration,
    window_seconds: i64,
    samples: RwLock<VecDeque<Sample>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self::with_window(config.interval, config.window_seconds())
    }

    pub fn with_window(interval: Duration, window_seconds: i64) -> Self {
        Self {
            interval,
            window_seconds,
            samples: RwLock::new(VecDeque::new()),
            task: Mutex::new(None),
        }
    }

    /// Start sampling the host with `sysinfo`
    pub fn start(self: &Arc<Self>) {
        self.start_with_probe(SystemProbe::new());
    }

    /// Take one sample immediately, then keep sampling every interval until
    /// [`Sampler::stop`]. Calling it while already running does nothing.
    pub fn start_with_probe<P: MetricsProbe>(self: &Arc<Self>, mut probe: P) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Sampler already running");
            return;
        }

        self.take_sample(&mut probe);

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(sampler) = weak.upgrade() else {
                    break;
                };
                sampler.take_sample(&mut probe);
            }
            debug!("Sampler task exited");
        }));

        info!(
            "Sampler started (interval {}, window {}s)",
            format_duration(&self.interval),
            self.window_seconds
        );
    }

    fn take_sample<P: MetricsProbe>(&self, probe: &mut P) {
        let (cpu_load, free_memory_bytes) = probe.read();
        self.record(Sample {
            time: Utc::now().timestamp(),
            cpu_load,
            free_memory_bytes,
        });
    }

    /// Append a sample and prune the window relative to its timestamp
    pub fn record(&self, sample: Sample) {
        let cutoff = sample.time - self.window_seconds;
        let mut samples = self.samples.write();
        samples.push_back(sample);
        samples.retain(|s| s.time >= cutoff);
    }

    /// Samples taken in the last `time_seconds` seconds, oldest first
    pub fn get(&self, time_seconds: i64) -> Vec<Sample> {
        self.get_at(Utc::now().timestamp(), time_seconds)
    }

    /// Samples with `time >= now - time_seconds`, oldest first
    pub fn get_at(&self, now: i64, time_seconds: i64) -> Vec<Sample> {
        let cutoff = now.saturating_sub(time_seconds);
        self.samples
            .read()
            .iter()
            .filter(|s| s.time >= cutoff)
            .copied()
            .collect()
    }

    /// Cancel the recurring schedule. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Sampler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests;
