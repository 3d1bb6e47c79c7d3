//! Device-query backends for the telemetry sampler
//!
//! The sampler only ever talks to a [`DeviceMonitor`]. Which implementation it gets is
//! decided once, at startup, by [`monitor_for`]:
//!
//! - [`AmdSysfsMonitor`]: amdgpu sysfs counters (`gpu_busy_percent`, `mem_info_vram_used`,
//!   hwmon `power1_average`)
//! - [`NvmlMonitor`]: NVML counters through one library handle bound at startup
//! - [`StubMonitor`]: scripted readings for tests and hardware-less dry runs

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

use crate::config::{AcceleratorBackend, BenchConfig};
use crate::error::{MedidorError, Result};

/// Default sysfs root for DRM devices
pub const DRM_SYSFS_ROOT: &str = "/sys/class/drm";

const AMD_PCI_VENDOR: &str = "0x1002";

/// One reading of one device at one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// Device ordinal (position in the visible device list, from 0)
    pub device: usize,
    /// GPU busy percentage, 0-100
    pub utilization_percent: f64,
    /// Device memory in use, bytes
    pub vram_used_bytes: u64,
    /// Board power draw, watts
    pub power_watts: f64,
}

/// Polymorphic device-query capability bound by the sampler
///
/// Ordinals passed to [`DeviceMonitor::read`] are always `0..device_count()`.
pub trait DeviceMonitor: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Number of devices this monitor covers
    fn device_count(&self) -> usize;

    /// Enable any device-level polling mode needed before reads
    ///
    /// # Errors
    /// Returns an error if the device refuses the mode change
    fn begin_polling(&self) -> Result<()> {
        Ok(())
    }

    /// Revert whatever [`DeviceMonitor::begin_polling`] changed
    ///
    /// # Errors
    /// Returns an error if the device refuses the mode change
    fn end_polling(&self) -> Result<()> {
        Ok(())
    }

    /// Read one sample from one device
    ///
    /// # Errors
    /// Returns `TelemetryGap` when the device cannot be read this tick
    fn read(&self, ordinal: usize) -> Result<TelemetrySample>;
}

/// Build the monitor selected by `config.backend`
///
/// # Errors
/// Returns `Configuration` if a visible device cannot be bound
pub fn monitor_for(config: &BenchConfig) -> Result<Arc<dyn DeviceMonitor>> {
    let monitor: Arc<dyn DeviceMonitor> = match config.backend {
        AcceleratorBackend::Amd => Arc::new(AmdSysfsMonitor::discover(
            Path::new(DRM_SYSFS_ROOT),
            &config.visible_devices,
        )?),
        AcceleratorBackend::Nvidia => {
            Arc::new(NvmlMonitor::new(config.visible_devices.clone())?)
        },
        AcceleratorBackend::Stub => Arc::new(StubMonitor::idle(config.visible_devices.len())),
    };
    tracing::debug!(
        backend = monitor.name(),
        devices = monitor.device_count(),
        "telemetry backend bound"
    );
    Ok(monitor)
}

fn gap(device: usize, reason: impl Into<String>) -> MedidorError {
    MedidorError::TelemetryGap {
        device,
        reason: reason.into(),
    }
}

// ============================================================================
// AMD (amdgpu sysfs)
// ============================================================================

/// AMD GPUs read through the amdgpu sysfs interface
#[derive(Debug, Clone)]
pub struct AmdSysfsMonitor {
    /// `.../cardN/device` directory per ordinal
    devices: Vec<PathBuf>,
}

impl AmdSysfsMonitor {
    /// Bind explicit device directories (one `.../cardN/device` per ordinal)
    #[must_use]
    pub fn from_device_dirs(devices: Vec<PathBuf>) -> Self {
        Self { devices }
    }

    /// Enumerate amdgpu cards under `root` and bind the ones named by `ids`
    ///
    /// Ids index the AMD cards in card-number order, which is the order the ROCm runtime
    /// enumerates them in.
    ///
    /// # Errors
    /// Returns `Configuration` if an id has no matching card
    pub fn discover(root: &Path, ids: &[u32]) -> Result<Self> {
        let mut cards: Vec<(u32, PathBuf)> = Vec::new();
        let entries = fs::read_dir(root).map_err(|e| {
            MedidorError::config(format!("cannot enumerate {}: {e}", root.display()))
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_prefix("card")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let device_dir = entry.path().join("device");
            let vendor = fs::read_to_string(device_dir.join("vendor")).unwrap_or_default();
            if vendor.trim() == AMD_PCI_VENDOR {
                cards.push((index, device_dir));
            }
        }
        cards.sort_by_key(|(index, _)| *index);

        let devices = ids
            .iter()
            .map(|&id| {
                cards
                    .get(id as usize)
                    .map(|(_, dir)| dir.clone())
                    .ok_or_else(|| {
                        MedidorError::config(format!(
                            "visible device {id} not found: {} amdgpu card(s) under {}",
                            cards.len(),
                            root.display()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { devices })
    }

    fn read_counter(device: usize, path: &Path) -> Result<u64> {
        let raw = fs::read_to_string(path)
            .map_err(|e| gap(device, format!("{}: {e}", path.display())))?;
        raw.trim()
            .parse()
            .map_err(|_| gap(device, format!("{}: unparsable '{}'", path.display(), raw.trim())))
    }

    /// hwmon reports microwatts; newer kernels expose `power1_input` instead of `power1_average`
    fn read_power_watts(device: usize, dir: &Path) -> Result<f64> {
        let hwmon_root = dir.join("hwmon");
        let hwmons = fs::read_dir(&hwmon_root)
            .map_err(|e| gap(device, format!("{}: {e}", hwmon_root.display())))?;
        for hwmon in hwmons.flatten() {
            for file in ["power1_average", "power1_input"] {
                let path = hwmon.path().join(file);
                if path.exists() {
                    let microwatts = Self::read_counter(device, &path)?;
                    return Ok(microwatts as f64 / 1_000_000.0);
                }
            }
        }
        Err(gap(device, "no hwmon power sensor"))
    }
}

impl DeviceMonitor for AmdSysfsMonitor {
    fn name(&self) -> &'static str {
        "amd-sysfs"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn read(&self, ordinal: usize) -> Result<TelemetrySample> {
        let dir = self
            .devices
            .get(ordinal)
            .ok_or_else(|| gap(ordinal, "ordinal out of range"))?;

        let utilization = Self::read_counter(ordinal, &dir.join("gpu_busy_percent"))?;
        let vram_used_bytes = Self::read_counter(ordinal, &dir.join("mem_info_vram_used"))?;
        let power_watts = Self::read_power_watts(ordinal, dir)?;

        Ok(TelemetrySample {
            device: ordinal,
            utilization_percent: utilization.min(100) as f64,
            vram_used_bytes,
            power_watts,
        })
    }
}

// ============================================================================
// NVIDIA (NVML)
// ============================================================================

/// NVIDIA GPUs read through NVML
///
/// The library is loaded once at construction; each read only fetches a device handle and
/// its counters, so a tick costs no process launches.
pub struct NvmlMonitor {
    nvml: Nvml,
    ids: Vec<u32>,
}

impl std::fmt::Debug for NvmlMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlMonitor")
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl NvmlMonitor {
    /// Load NVML and bind the given hardware indices
    ///
    /// # Errors
    /// Returns `Configuration` if NVML cannot be loaded or an index has no device
    pub fn new(ids: Vec<u32>) -> Result<Self> {
        let nvml = Nvml::init()
            .map_err(|e| MedidorError::config(format!("cannot initialise NVML: {e}")))?;
        let count = nvml
            .device_count()
            .map_err(|e| MedidorError::config(format!("cannot count NVML devices: {e}")))?;
        if let Some(id) = ids.iter().find(|&&id| id >= count) {
            return Err(MedidorError::config(format!(
                "visible device {id} not found: NVML reports {count} device(s)"
            )));
        }
        Ok(Self { nvml, ids })
    }

    /// Build a sample from raw NVML counters (percent, bytes, milliwatts)
    #[must_use]
    pub fn sample_from_counters(
        ordinal: usize,
        utilization_percent: u32,
        vram_used_bytes: u64,
        power_milliwatts: u32,
    ) -> TelemetrySample {
        TelemetrySample {
            device: ordinal,
            utilization_percent: f64::from(utilization_percent.min(100)),
            vram_used_bytes,
            power_watts: f64::from(power_milliwatts) / 1000.0,
        }
    }
}

fn nvml_gap(device: usize, counter: &str, e: &NvmlError) -> MedidorError {
    gap(device, format!("NVML {counter}: {e}"))
}

impl DeviceMonitor for NvmlMonitor {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn device_count(&self) -> usize {
        self.ids.len()
    }

    fn read(&self, ordinal: usize) -> Result<TelemetrySample> {
        let id = *self
            .ids
            .get(ordinal)
            .ok_or_else(|| gap(ordinal, "ordinal out of range"))?;

        let device = self
            .nvml
            .device_by_index(id)
            .map_err(|e| nvml_gap(ordinal, "device handle", &e))?;
        let utilization = device
            .utilization_rates()
            .map_err(|e| nvml_gap(ordinal, "utilization", &e))?;
        let memory = device
            .memory_info()
            .map_err(|e| nvml_gap(ordinal, "memory", &e))?;
        let power_milliwatts = device
            .power_usage()
            .map_err(|e| nvml_gap(ordinal, "power", &e))?;

        Ok(Self::sample_from_counters(
            ordinal,
            utilization.gpu,
            memory.used,
            power_milliwatts,
        ))
    }
}

// ============================================================================
// Stub (scripted)
// ============================================================================

/// One scripted reading, or a scripted read failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StubReading {
    /// Successful reading
    Ok {
        /// Utilization percent
        utilization_percent: f64,
        /// VRAM bytes
        vram_used_bytes: u64,
        /// Power watts
        power_watts: f64,
    },
    /// Read failure for this tick
    Fail,
}

impl StubReading {
    /// Successful reading shorthand
    #[must_use]
    pub fn ok(utilization_percent: f64, vram_used_bytes: u64, power_watts: f64) -> Self {
        Self::Ok {
            utilization_percent,
            vram_used_bytes,
            power_watts,
        }
    }
}

/// Scripted monitor for tests and hardware-less runs
///
/// Each device replays its script one entry per read and then keeps repeating the last
/// entry. Polling-mode calls and reads are counted so tests can observe the sampler.
#[derive(Debug)]
pub struct StubMonitor {
    scripts: Mutex<Vec<VecDeque<StubReading>>>,
    begin_calls: AtomicUsize,
    end_calls: AtomicUsize,
    reads: AtomicUsize,
}

impl StubMonitor {
    /// `devices` devices that always read as idle (0 W, 0 %, 0 bytes)
    #[must_use]
    pub fn idle(devices: usize) -> Self {
        Self::constant(devices, StubReading::ok(0.0, 0, 0.0))
    }

    /// `devices` devices that always return `reading`
    #[must_use]
    pub fn constant(devices: usize, reading: StubReading) -> Self {
        Self::scripted(vec![vec![reading]; devices])
    }

    /// One script per device
    #[must_use]
    pub fn scripted(scripts: Vec<Vec<StubReading>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(VecDeque::from).collect()),
            begin_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of `begin_polling` calls so far
    #[must_use]
    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::Acquire)
    }

    /// Number of `end_polling` calls so far
    #[must_use]
    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::Acquire)
    }

    /// Number of `read` calls so far, successful or not
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl DeviceMonitor for StubMonitor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn device_count(&self) -> usize {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn begin_polling(&self) -> Result<()> {
        self.begin_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn end_polling(&self) -> Result<()> {
        self.end_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn read(&self, ordinal: usize) -> Result<TelemetrySample> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let script = scripts
            .get_mut(ordinal)
            .ok_or_else(|| gap(ordinal, "ordinal out of range"))?;

        let reading = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };

        match reading {
            Some(StubReading::Ok {
                utilization_percent,
                vram_used_bytes,
                power_watts,
            }) => Ok(TelemetrySample {
                device: ordinal,
                utilization_percent,
                vram_used_bytes,
                power_watts,
            }),
            Some(StubReading::Fail) => Err(gap(ordinal, "scripted read failure")),
            None => Err(gap(ordinal, "empty script")),
        }
    }
}
