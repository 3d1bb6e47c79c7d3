//! Background accelerator telemetry
//!
//! A [`TelemetrySampler`] brackets exactly one operation: `start()` right before it,
//! `stop()` right after. In between, one background thread reads every device on a fixed
//! interval and folds the readings into a per-run [`TelemetryAggregator`].
//!
//! ## Idle-power gate
//!
//! Nothing is recorded until some device draws more than `idle_power_watts`. This keeps
//! model-load and warm-up time out of the statistics. Once open, the gate stays open for
//! the rest of the run.
//!
//! ## Synchronization
//!
//! The aggregator is moved into the sampling thread and only comes back through the
//! thread's `JoinHandle`. Statistics are therefore computed from an aggregator that no
//! thread can still write to; [`TelemetrySampler::get_stats`] stops a running sampler
//! before reading.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use medidor::telemetry::{SamplerConfig, StubMonitor, StubReading, TelemetrySampler};
//!
//! let monitor = Arc::new(StubMonitor::constant(1, StubReading::ok(90.0, 1 << 30, 250.0)));
//! let config = SamplerConfig::new().with_interval(Duration::from_millis(5));
//! let mut sampler = TelemetrySampler::new(monitor, config);
//!
//! sampler.start().expect("spawn sampler");
//! std::thread::sleep(Duration::from_millis(50));
//! sampler.stop();
//!
//! let stats = sampler.get_stats();
//! assert!(stats.slot(0).is_some());
//! ```

pub mod aggregate;
pub mod backend;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

pub use aggregate::{Aggregate, DeviceSummary, TelemetryAggregator, TelemetryStats};
pub use backend::{
    monitor_for, AmdSysfsMonitor, DeviceMonitor, NvmlMonitor, StubMonitor, StubReading,
    TelemetrySample,
};

use crate::config::BenchConfig;
use crate::error::Result;

/// Sampling parameters for one sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
    /// Sleep between ticks
    pub interval: Duration,
    /// Power (W) some device must exceed before recording starts
    pub idle_power_watts: f64,
    /// The sampling thread exits on its own after this long
    pub max_duration: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            idle_power_watts: 41.0,
            max_duration: Duration::from_secs(900),
        }
    }
}

impl SamplerConfig {
    /// Create with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set tick interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set idle-power gate threshold
    #[must_use]
    pub fn with_idle_power_watts(mut self, watts: f64) -> Self {
        self.idle_power_watts = watts;
        self
    }

    /// Set the safety deadline
    #[must_use]
    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }
}

impl From<&BenchConfig> for SamplerConfig {
    fn from(config: &BenchConfig) -> Self {
        Self {
            interval: config.sample_interval,
            idle_power_watts: config.idle_power_watts,
            max_duration: config.max_sampling,
        }
    }
}

enum SamplerState {
    Idle,
    Running {
        stop_tx: mpsc::Sender<()>,
        handle: JoinHandle<TelemetryAggregator>,
    },
    Finished(TelemetryStats),
}

/// Background device-metric collector for one bracketed operation
pub struct TelemetrySampler {
    monitor: Arc<dyn DeviceMonitor>,
    config: SamplerConfig,
    state: SamplerState,
}

impl std::fmt::Debug for TelemetrySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SamplerState::Idle => "idle",
            SamplerState::Running { .. } => "running",
            SamplerState::Finished(_) => "finished",
        };
        f.debug_struct("TelemetrySampler")
            .field("backend", &self.monitor.name())
            .field("config", &self.config)
            .field("state", &state)
            .finish()
    }
}

impl TelemetrySampler {
    /// Create an idle sampler over `monitor`'s devices
    #[must_use]
    pub fn new(monitor: Arc<dyn DeviceMonitor>, config: SamplerConfig) -> Self {
        Self {
            monitor,
            config,
            state: SamplerState::Idle,
        }
    }

    /// Whether the background thread is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, SamplerState::Running { .. })
    }

    /// Number of devices sampled
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.monitor.device_count()
    }

    /// Begin sampling in one background thread
    ///
    /// Calling this while running, or after the run has finished, logs a warning and does
    /// nothing.
    ///
    /// # Errors
    /// Returns `Io` if the OS refuses to spawn the thread
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SamplerState::Running { .. } => {
                warn!("telemetry sampler already running; ignoring start()");
                return Ok(());
            },
            SamplerState::Finished(_) => {
                warn!("telemetry sampler already completed its run; ignoring start()");
                return Ok(());
            },
            SamplerState::Idle => {},
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let monitor = Arc::clone(&self.monitor);
        let config = self.config;
        let aggregator = TelemetryAggregator::new(monitor.device_count());

        let handle = thread::Builder::new()
            .name("medidor-telemetry".to_string())
            .spawn(move || sampling_loop(monitor.as_ref(), config, &stop_rx, aggregator))?;

        debug!(
            backend = self.monitor.name(),
            interval_ms = config.interval.as_millis() as u64,
            "telemetry sampler started"
        );
        self.state = SamplerState::Running { stop_tx, handle };
        Ok(())
    }

    /// Signal the background thread and block until it has exited
    ///
    /// The thread disables device polling mode before exiting, so both are complete when
    /// this returns. No-op if the sampler never started or already stopped.
    pub fn stop(&mut self) {
        let state = std::mem::replace(&mut self.state, SamplerState::Idle);
        self.state = match state {
            SamplerState::Running { stop_tx, handle } => {
                drop(stop_tx);
                match handle.join() {
                    Ok(aggregator) => SamplerState::Finished(aggregator.summarize()),
                    Err(_) => {
                        error!("telemetry sampling thread panicked; statistics unavailable");
                        SamplerState::Finished(TelemetryStats::unavailable(
                            self.monitor.device_count(),
                        ))
                    },
                }
            },
            other => other,
        };
    }

    /// Per-device statistics of the run
    ///
    /// Stops the sampler first if it is still running. Repeated calls return identical
    /// values. A sampler that never started reports every device as unavailable.
    pub fn get_stats(&mut self) -> TelemetryStats {
        self.stop();
        match &self.state {
            SamplerState::Finished(stats) => stats.clone(),
            _ => TelemetryStats::unavailable(self.monitor.device_count()),
        }
    }
}

impl Drop for TelemetrySampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn gate_opens(monitor: &dyn DeviceMonitor, threshold_watts: f64) -> bool {
    for ordinal in 0..monitor.device_count() {
        match monitor.read(ordinal) {
            Ok(sample) if sample.power_watts > threshold_watts => {
                info!(
                    device = ordinal,
                    power_watts = sample.power_watts,
                    threshold_watts,
                    "idle-power gate opened"
                );
                return true;
            },
            Ok(_) => {},
            Err(e) => warn!(device = ordinal, error = %e, "telemetry read failed during gate check"),
        }
    }
    false
}

fn sampling_loop(
    monitor: &dyn DeviceMonitor,
    config: SamplerConfig,
    stop_rx: &mpsc::Receiver<()>,
    mut aggregator: TelemetryAggregator,
) -> TelemetryAggregator {
    if let Err(e) = monitor.begin_polling() {
        warn!(backend = monitor.name(), error = %e, "failed to enable polling mode");
    }

    let started = Instant::now();
    let mut gate_open = false;

    loop {
        if gate_open {
            for ordinal in 0..monitor.device_count() {
                match monitor.read(ordinal) {
                    Ok(sample) => aggregator.record(&sample),
                    Err(e) => warn!(device = ordinal, error = %e, "telemetry gap"),
                }
            }
        } else {
            gate_open = gate_opens(monitor, config.idle_power_watts);
        }

        if started.elapsed() >= config.max_duration {
            warn!(
                max_secs = config.max_duration.as_secs(),
                "telemetry sampler hit its deadline; stopping"
            );
            break;
        }

        // The stop channel doubles as the tick sleep so shutdown is immediate
        match stop_rx.recv_timeout(config.interval) {
            Err(RecvTimeoutError::Timeout) => {},
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Err(e) = monitor.end_polling() {
        warn!(backend = monitor.name(), error = %e, "failed to disable polling mode");
    }
    aggregator
}

#[cfg(test)]
#[path = "tests.rs"]
mod sampler_tests;
