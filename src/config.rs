//! Benchmark configuration
//!
//! Everything the core consumes from the environment lives in [`BenchConfig`]: which
//! accelerator backend to bind, which devices are visible, the idle-power gate, the
//! sampling cadence, memory budgets and the endpoint's time-unit convention.
//!
//! ## Example
//!
//! ```rust
//! use medidor::config::{AcceleratorBackend, BenchConfig, DurationUnit};
//!
//! let config = BenchConfig::new()
//!     .with_backend(AcceleratorBackend::Stub)
//!     .with_visible_devices(vec![0, 1])
//!     .with_duration_unit(DurationUnit::Microseconds);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.visible_devices.len(), 2);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MedidorError, Result};

/// Optional dotenv file read from the working directory at startup
pub const ENV_FILE_NAME: &str = ".env";

/// File name of the CSV result sink inside `result_dir`
pub const RESULT_FILE_NAME: &str = "ollama_results.csv";

/// Default inference endpoint address
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:11434";

/// Accelerator family the telemetry sampler binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorBackend {
    /// AMD GPUs through the amdgpu sysfs interface
    Amd,
    /// NVIDIA GPUs through NVML
    Nvidia,
    /// Scripted readings, no hardware
    Stub,
}

impl AcceleratorBackend {
    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd => "amd",
            Self::Nvidia => "nvidia",
            Self::Stub => "stub",
        }
    }

    /// Parse from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "amd" | "rocm" => Some(Self::Amd),
            "nvidia" | "cuda" => Some(Self::Nvidia),
            "stub" | "mock" | "none" => Some(Self::Stub),
            _ => None,
        }
    }

    /// Environment variable the vendor runtime uses to restrict visible devices
    #[must_use]
    pub fn visible_devices_var(&self) -> &'static str {
        match self {
            Self::Amd => "ROCR_VISIBLE_DEVICES",
            Self::Nvidia => "CUDA_VISIBLE_DEVICES",
            Self::Stub => "MEDIDOR_VISIBLE_DEVICES",
        }
    }
}

/// Time unit of the endpoint's evaluation durations
///
/// Chosen by configuration, never inferred from magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    /// Current Ollama revisions
    Nanoseconds,
    /// Legacy endpoint revision
    Microseconds,
}

impl DurationUnit {
    /// Number of units per second
    #[must_use]
    pub fn per_second(&self) -> f64 {
        match self {
            Self::Nanoseconds => 1_000_000_000.0,
            Self::Microseconds => 1_000_000.0,
        }
    }

    /// Parse from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ns" | "nanos" | "nanoseconds" => Some(Self::Nanoseconds),
            "us" | "µs" | "micros" | "microseconds" => Some(Self::Microseconds),
            _ => None,
        }
    }
}

/// Which evaluation phase of the response the throughput is computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalPhase {
    /// `eval_count` / `eval_duration` (generated tokens)
    Generation,
    /// `prompt_eval_count` / `prompt_eval_duration` (prompt processing)
    Prompt,
}

impl EvalPhase {
    /// Parse from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "generation" | "eval" => Some(Self::Generation),
            "prompt" | "prompt_eval" => Some(Self::Prompt),
            _ => None,
        }
    }
}

/// Configuration consumed by the sampler, runner, capacity guard and result sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Device-query implementation for the telemetry sampler
    pub backend: AcceleratorBackend,
    /// Hardware ids of the devices this job may use, in ordinal order
    pub visible_devices: Vec<u32>,
    /// Power draw (W) any device must exceed before samples are recorded
    pub idle_power_watts: f64,
    /// Sleep between sampling ticks
    pub sample_interval: Duration,
    /// Hard ceiling on how long one sampler may run
    pub max_sampling: Duration,
    /// Memory capacity of one device in GB
    pub per_device_vram_gb: f64,
    /// Headroom added to the model footprint in the capacity check
    pub safety_margin_gb: f64,
    /// Number of device slots in every output record
    pub max_devices: usize,
    /// Time unit of endpoint durations
    pub duration_unit: DurationUnit,
    /// Which counters the throughput is derived from
    pub eval_phase: EvalPhase,
    /// Emit utilization columns in the output record
    pub record_utilization: bool,
    /// Timeout for one endpoint request
    pub request_timeout: Duration,
    /// Directory holding the CSV result sink
    pub result_dir: PathBuf,
    /// Model manifest (`{"models": [...], "weights": [...]}`)
    pub models_path: Option<PathBuf>,
    /// Prompt manifest (`{"prompts": [...]}`)
    pub prompts_path: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            backend: AcceleratorBackend::Amd,
            visible_devices: vec![0],
            // MI210 idles just under this
            idle_power_watts: 41.0,
            sample_interval: Duration::from_millis(100),
            max_sampling: Duration::from_secs(900),
            per_device_vram_gb: 64.0,
            safety_margin_gb: 2.0,
            max_devices: 8,
            duration_unit: DurationUnit::Nanoseconds,
            eval_phase: EvalPhase::Generation,
            record_utilization: true,
            request_timeout: Duration::from_secs(600),
            result_dir: PathBuf::from("."),
            models_path: None,
            prompts_path: None,
        }
    }
}

impl BenchConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the accelerator backend
    #[must_use]
    pub fn with_backend(mut self, backend: AcceleratorBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the visible device ids
    #[must_use]
    pub fn with_visible_devices(mut self, devices: Vec<u32>) -> Self {
        self.visible_devices = devices;
        self
    }

    /// Set the idle-power gate threshold in watts
    #[must_use]
    pub fn with_idle_power_watts(mut self, watts: f64) -> Self {
        self.idle_power_watts = watts;
        self
    }

    /// Set the sampling interval
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Set the sampler safety deadline
    #[must_use]
    pub fn with_max_sampling(mut self, max: Duration) -> Self {
        self.max_sampling = max;
        self
    }

    /// Set per-device memory capacity in GB
    #[must_use]
    pub fn with_per_device_vram_gb(mut self, gb: f64) -> Self {
        self.per_device_vram_gb = gb;
        self
    }

    /// Set the capacity safety margin in GB
    #[must_use]
    pub fn with_safety_margin_gb(mut self, gb: f64) -> Self {
        self.safety_margin_gb = gb;
        self
    }

    /// Set the number of output device slots
    #[must_use]
    pub fn with_max_devices(mut self, n: usize) -> Self {
        self.max_devices = n;
        self
    }

    /// Set the endpoint duration unit
    #[must_use]
    pub fn with_duration_unit(mut self, unit: DurationUnit) -> Self {
        self.duration_unit = unit;
        self
    }

    /// Set the evaluation phase used for throughput
    #[must_use]
    pub fn with_eval_phase(mut self, phase: EvalPhase) -> Self {
        self.eval_phase = phase;
        self
    }

    /// Enable/disable utilization columns
    #[must_use]
    pub fn with_record_utilization(mut self, enabled: bool) -> Self {
        self.record_utilization = enabled;
        self
    }

    /// Set the endpoint request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the result directory
    #[must_use]
    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = dir.into();
        self
    }

    /// Path of the CSV result sink
    #[must_use]
    pub fn result_file(&self) -> PathBuf {
        self.result_dir.join(RESULT_FILE_NAME)
    }

    /// Load from the process environment layered over an optional `.env` file
    ///
    /// # Errors
    /// Returns `Configuration` if any variable is malformed or `.env` does not parse
    pub fn from_env() -> Result<Self> {
        Self::from_lookup_with_file(|key| std::env::var(key).ok(), Path::new(ENV_FILE_NAME))
    }

    /// Load from `lookup`, falling back to the `KEY=value` pairs of `env_file` if it exists
    ///
    /// Values from `lookup` win, so a variable exported in the shell overrides the file.
    ///
    /// # Errors
    /// Returns `Configuration` if the file does not parse or any value is malformed
    pub fn from_lookup_with_file(
        lookup: impl Fn(&str) -> Option<String>,
        env_file: &Path,
    ) -> Result<Self> {
        let file = if env_file.is_file() {
            read_env_file(env_file)?
        } else {
            HashMap::new()
        };
        Self::from_lookup(|key| lookup(key).or_else(|| file.get(key).cloned()))
    }

    /// Load from an arbitrary key lookup (the environment in production)
    ///
    /// # Errors
    /// Returns `Configuration` if any value is malformed or the result fails validation
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("MEDIDOR_BACKEND") {
            config.backend = AcceleratorBackend::parse(&raw).ok_or_else(|| {
                MedidorError::config(format!("unknown accelerator backend '{raw}'"))
            })?;
        }

        let devices = lookup("MEDIDOR_VISIBLE_DEVICES")
            .or_else(|| lookup(config.backend.visible_devices_var()));
        if let Some(raw) = devices {
            config.visible_devices = parse_device_list(&raw)?;
        }

        if let Some(raw) = lookup("MEDIDOR_IDLE_POWER_W") {
            config.idle_power_watts = parse_number("MEDIDOR_IDLE_POWER_W", &raw)?;
        }
        if let Some(raw) = lookup("MEDIDOR_SAMPLE_INTERVAL_MS") {
            let ms: u64 = parse_number("MEDIDOR_SAMPLE_INTERVAL_MS", &raw)?;
            config.sample_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("MEDIDOR_MAX_SAMPLING_SECS") {
            let secs: u64 = parse_number("MEDIDOR_MAX_SAMPLING_SECS", &raw)?;
            config.max_sampling = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("MEDIDOR_VRAM_CAP_GB") {
            config.per_device_vram_gb = parse_number("MEDIDOR_VRAM_CAP_GB", &raw)?;
        }
        if let Some(raw) = lookup("MEDIDOR_SAFETY_MARGIN_GB") {
            config.safety_margin_gb = parse_number("MEDIDOR_SAFETY_MARGIN_GB", &raw)?;
        }
        if let Some(raw) = lookup("MEDIDOR_MAX_DEVICES") {
            config.max_devices = parse_number("MEDIDOR_MAX_DEVICES", &raw)?;
        }
        if let Some(raw) = lookup("MEDIDOR_DURATION_UNIT") {
            config.duration_unit = DurationUnit::parse(&raw)
                .ok_or_else(|| MedidorError::config(format!("unknown duration unit '{raw}'")))?;
        }
        if let Some(raw) = lookup("MEDIDOR_EVAL_PHASE") {
            config.eval_phase = EvalPhase::parse(&raw)
                .ok_or_else(|| MedidorError::config(format!("unknown eval phase '{raw}'")))?;
        }
        if let Some(raw) = lookup("MEDIDOR_RECORD_UTILIZATION") {
            config.record_utilization = parse_bool("MEDIDOR_RECORD_UTILIZATION", &raw)?;
        }
        if let Some(raw) = lookup("MEDIDOR_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_number("MEDIDOR_REQUEST_TIMEOUT_SECS", &raw)?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("RESULT_PATH") {
            config.result_dir = PathBuf::from(raw);
        }
        config.models_path = lookup("MODELS_JSON_PATH").map(PathBuf::from);
        config.prompts_path = lookup("PROMPTS_JSON_PATH").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns `Configuration` describing the first inconsistency found
    pub fn validate(&self) -> Result<()> {
        if self.visible_devices.is_empty() {
            return Err(MedidorError::config("visible device list is empty"));
        }
        if self.max_devices == 0 {
            return Err(MedidorError::config("max_devices must be at least 1"));
        }
        if self.visible_devices.len() > self.max_devices {
            return Err(MedidorError::config(format!(
                "{} visible devices exceed the {} output slots",
                self.visible_devices.len(),
                self.max_devices
            )));
        }
        if self.sample_interval.is_zero() {
            return Err(MedidorError::config("sample interval must be non-zero"));
        }
        if !self.idle_power_watts.is_finite() || self.idle_power_watts < 0.0 {
            return Err(MedidorError::config(format!(
                "idle power threshold must be a non-negative number, got {}",
                self.idle_power_watts
            )));
        }
        if !self.per_device_vram_gb.is_finite() || self.per_device_vram_gb <= 0.0 {
            return Err(MedidorError::config(format!(
                "per-device VRAM cap must be positive, got {}",
                self.per_device_vram_gb
            )));
        }
        if !self.safety_margin_gb.is_finite() || self.safety_margin_gb < 0.0 {
            return Err(MedidorError::config(format!(
                "safety margin must be non-negative, got {}",
                self.safety_margin_gb
            )));
        }
        Ok(())
    }
}

/// Read the `KEY=value` pairs of a dotenv file without touching the process environment
///
/// # Errors
/// Returns `Configuration` if the file cannot be read or a line does not parse
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let invalid =
        |e: dotenvy::Error| MedidorError::config(format!("invalid {}: {e}", path.display()));
    dotenvy::from_path_iter(path)
        .map_err(invalid)?
        .map(|item| item.map_err(invalid))
        .collect()
}

/// Parse a comma-separated device id list such as `"0,1,3"`
///
/// # Errors
/// Returns `Configuration` for empty entries, non-numeric entries or duplicates
pub fn parse_device_list(raw: &str) -> Result<Vec<u32>> {
    let mut devices = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(MedidorError::config(format!(
                "malformed device list '{raw}': empty entry"
            )));
        }
        let id: u32 = entry.parse().map_err(|_| {
            MedidorError::config(format!("malformed device list '{raw}': '{entry}' is not an id"))
        })?;
        if devices.contains(&id) {
            return Err(MedidorError::config(format!(
                "malformed device list '{raw}': device {id} listed twice"
            )));
        }
        devices.push(id);
    }
    Ok(devices)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| MedidorError::config(format!("{key}: '{raw}' is not a valid number")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MedidorError::config(format!(
            "{key}: '{raw}' is not a boolean"
        ))),
    }
}
