//! Per-run telemetry aggregation
//!
//! The aggregator keeps running sums per device ordinal instead of growing sample lists.
//! A device that never recorded a sample summarizes to `None`, so "no data" can never be
//! confused with a zero reading.

use serde::{Deserialize, Serialize};

use super::backend::TelemetrySample;

/// Average and maximum of one metric on one device
///
/// Both values are present together or the whole aggregate is absent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Arithmetic mean of recorded values
    pub avg: f64,
    /// Largest recorded value
    pub max: f64,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Rounding in `sum` can push the mean a ulp outside the observed range; clamp it back
    fn finish(&self, count: usize) -> Aggregate {
        let avg = (self.sum / count as f64).clamp(self.min, self.max);
        Aggregate { avg, max: self.max }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceAccumulator {
    samples: usize,
    utilization: Accumulator,
    vram: Accumulator,
    power: Accumulator,
}

impl DeviceAccumulator {
    fn new() -> Self {
        Self {
            samples: 0,
            utilization: Accumulator::new(),
            vram: Accumulator::new(),
            power: Accumulator::new(),
        }
    }

    fn summarize(&self) -> Option<DeviceSummary> {
        if self.samples == 0 {
            return None;
        }
        Some(DeviceSummary {
            samples: self.samples,
            utilization_percent: self.utilization.finish(self.samples),
            vram_bytes: self.vram.finish(self.samples),
            power_watts: self.power.finish(self.samples),
        })
    }
}

/// The six aggregate fields of one device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Number of post-gate samples the aggregates were computed from
    pub samples: usize,
    /// Utilization, percent
    pub utilization_percent: Aggregate,
    /// VRAM in use, bytes
    pub vram_bytes: Aggregate,
    /// Power draw, watts
    pub power_watts: Aggregate,
}

/// Owned per-run aggregator indexed by device ordinal
#[derive(Debug, Clone)]
pub struct TelemetryAggregator {
    devices: Vec<DeviceAccumulator>,
}

impl TelemetryAggregator {
    /// Fresh aggregator for `devices` ordinals
    #[must_use]
    pub fn new(devices: usize) -> Self {
        Self {
            devices: vec![DeviceAccumulator::new(); devices],
        }
    }

    /// Number of device ordinals tracked
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Fold one sample into its device's accumulator
    ///
    /// Samples for ordinals outside `0..device_count()` are ignored.
    pub fn record(&mut self, sample: &TelemetrySample) {
        let Some(device) = self.devices.get_mut(sample.device) else {
            return;
        };
        device.samples += 1;
        device.utilization.push(sample.utilization_percent);
        device.vram.push(sample.vram_used_bytes as f64);
        device.power.push(sample.power_watts);
    }

    /// Samples recorded for `device` so far
    #[must_use]
    pub fn sample_count(&self, device: usize) -> usize {
        self.devices.get(device).map_or(0, |d| d.samples)
    }

    /// Compute the per-device statistics
    #[must_use]
    pub fn summarize(&self) -> TelemetryStats {
        TelemetryStats {
            devices: self
                .devices
                .iter()
                .map(DeviceAccumulator::summarize)
                .collect(),
        }
    }
}

/// Aggregated telemetry of one sampler run
///
/// Index `i` is device ordinal `i`. `None` means no qualifying samples (unavailable).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryStats {
    devices: Vec<Option<DeviceSummary>>,
}

impl TelemetryStats {
    /// Stats for `devices` ordinals, all unavailable
    #[must_use]
    pub fn unavailable(devices: usize) -> Self {
        Self {
            devices: vec![None; devices],
        }
    }

    /// Stats from precomputed per-device summaries
    #[must_use]
    pub fn from_summaries(devices: Vec<Option<DeviceSummary>>) -> Self {
        Self { devices }
    }

    /// Number of sampled device ordinals
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Summary for output slot `slot`; `None` if unavailable or beyond the sampled devices
    #[must_use]
    pub fn slot(&self, slot: usize) -> Option<&DeviceSummary> {
        self.devices.get(slot).and_then(Option::as_ref)
    }

    /// Whether any device recorded at least one sample
    #[must_use]
    pub fn any_available(&self) -> bool {
        self.devices.iter().any(Option::is_some)
    }
}
