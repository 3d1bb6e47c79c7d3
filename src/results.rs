//! Fixed-schema result records and the CSV sink
//!
//! [`ResultAggregator`] merges identity fields, throughput and per-device telemetry into one
//! [`RunResult`] per prompt. The schema width depends only on `max_devices`, never on how many
//! devices a run used: slots past the active GPU count are filled as unavailable.
//!
//! ## Columns
//!
//! `Model, Params, Quantization, Tokens/s, Num_Gpus`, then for every slot `i`:
//! `GPU<i>_Util_avg, GPU<i>_Util_max` (optional), `GPU<i>_Power_avg, GPU<i>_Power_max,
//! GPU<i>_VRAM_usage_avg, GPU<i>_VRAM_usage_max`. VRAM is in MiB; unavailable cells are
//! `N/A`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BenchConfig;
use crate::error::Result;
use crate::runner::Throughput;
use crate::telemetry::{Aggregate, DeviceSummary, TelemetryStats};

/// Marker for a cell with no value
pub const UNAVAILABLE: &str = "N/A";

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Identity columns of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Model identifier as sent to the endpoint
    pub model: String,
    /// Parameter size as reported by the endpoint, e.g. `"7B"`
    pub parameter_size: String,
    /// Quantization label as reported by the endpoint, e.g. `"Q4_0"`
    pub quantization_level: String,
}

impl ModelIdentity {
    /// Identity with metadata
    pub fn new(
        model: impl Into<String>,
        parameter_size: impl Into<String>,
        quantization_level: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            parameter_size: parameter_size.into(),
            quantization_level: quantization_level.into(),
        }
    }

    /// Identity for a model whose metadata could not be fetched
    pub fn unknown(model: impl Into<String>) -> Self {
        Self::new(model, UNAVAILABLE, UNAVAILABLE)
    }
}

/// One output record; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Model identity
    pub identity: ModelIdentity,
    /// Tokens per second or why it is missing
    pub throughput: Throughput,
    /// Devices the job ran on
    pub gpu_count: usize,
    /// Exactly `max_devices` slots; `None` means unavailable
    pub slots: Vec<Option<DeviceSummary>>,
}

/// Builds fixed-width records and renders them as rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultAggregator {
    max_devices: usize,
    record_utilization: bool,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::from(&BenchConfig::default())
    }
}

impl From<&BenchConfig> for ResultAggregator {
    fn from(config: &BenchConfig) -> Self {
        Self::new(config.max_devices, config.record_utilization)
    }
}

impl ResultAggregator {
    /// Schema with `max_devices` slots
    #[must_use]
    pub fn new(max_devices: usize, record_utilization: bool) -> Self {
        Self {
            max_devices,
            record_utilization,
        }
    }

    /// Number of device slots per record
    #[must_use]
    pub fn max_devices(&self) -> usize {
        self.max_devices
    }

    /// Merge one prompt's outputs into a record
    ///
    /// Slots `0..gpu_count` take the sampler's summaries; every other slot is unavailable.
    #[must_use]
    pub fn record(
        &self,
        identity: ModelIdentity,
        throughput: Throughput,
        gpu_count: usize,
        stats: &TelemetryStats,
    ) -> RunResult {
        let slots = (0..self.max_devices)
            .map(|slot| {
                if slot < gpu_count {
                    stats.slot(slot).copied()
                } else {
                    None
                }
            })
            .collect();

        RunResult {
            identity,
            throughput,
            gpu_count,
            slots,
        }
    }

    /// Column names in output order
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        let mut columns: Vec<String> = ["Model", "Params", "Quantization", "Tokens/s", "Num_Gpus"]
            .iter()
            .map(ToString::to_string)
            .collect();

        for i in 0..self.max_devices {
            if self.record_utilization {
                columns.push(format!("GPU{i}_Util_avg"));
                columns.push(format!("GPU{i}_Util_max"));
            }
            columns.push(format!("GPU{i}_Power_avg"));
            columns.push(format!("GPU{i}_Power_max"));
            columns.push(format!("GPU{i}_VRAM_usage_avg"));
            columns.push(format!("GPU{i}_VRAM_usage_max"));
        }
        columns
    }

    /// Cells of `result` in header order
    #[must_use]
    pub fn row(&self, result: &RunResult) -> Vec<String> {
        let mut cells = vec![
            result.identity.model.clone(),
            result.identity.parameter_size.clone(),
            result.identity.quantization_level.clone(),
            result.throughput.to_string(),
            result.gpu_count.to_string(),
        ];

        for i in 0..self.max_devices {
            let summary = result.slots.get(i).copied().flatten();
            if self.record_utilization {
                push_pair(&mut cells, summary.map(|s| s.utilization_percent), 1.0);
            }
            push_pair(&mut cells, summary.map(|s| s.power_watts), 1.0);
            push_pair(&mut cells, summary.map(|s| s.vram_bytes), BYTES_PER_MIB);
        }
        cells
    }
}

fn push_pair(cells: &mut Vec<String>, aggregate: Option<Aggregate>, divisor: f64) {
    match aggregate {
        Some(a) => {
            cells.push(format!("{:.2}", a.avg / divisor));
            cells.push(format!("{:.2}", a.max / divisor));
        },
        None => {
            cells.push(UNAVAILABLE.to_string());
            cells.push(UNAVAILABLE.to_string());
        },
    }
}

/// Destination of finished records
pub trait ResultSink {
    /// Append one record
    ///
    /// # Errors
    /// Returns `Io`/`Csv` if the record cannot be written
    fn append(&mut self, result: &RunResult) -> Result<()>;
}

impl ResultSink for Vec<RunResult> {
    fn append(&mut self, result: &RunResult) -> Result<()> {
        self.push(result.clone());
        Ok(())
    }
}

/// Append-only CSV file sink
///
/// The header is written once: only if the file did not exist or was empty when opened.
pub struct CsvResultSink {
    path: PathBuf,
    aggregator: ResultAggregator,
    writer: csv::Writer<File>,
    header_written: bool,
}

impl std::fmt::Debug for CsvResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvResultSink")
            .field("path", &self.path)
            .field("aggregator", &self.aggregator)
            .field("header_written", &self.header_written)
            .finish_non_exhaustive()
    }
}

impl CsvResultSink {
    /// Open (or create) `path` for appending
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be opened
    pub fn open(path: impl AsRef<Path>, aggregator: ResultAggregator) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let header_written = file.metadata()?.len() > 0;
        debug!(path = %path.display(), header_written, "opened result sink");

        Ok(Self {
            path,
            aggregator,
            writer: csv::WriterBuilder::new().has_headers(false).from_writer(file),
            header_written,
        })
    }

    /// Path of the CSV file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for CsvResultSink {
    fn append(&mut self, result: &RunResult) -> Result<()> {
        if !self.header_written {
            self.writer.write_record(self.aggregator.header())?;
            self.header_written = true;
        }
        self.writer.write_record(self.aggregator.row(result))?;
        self.writer.flush()?;
        Ok(())
    }
}
