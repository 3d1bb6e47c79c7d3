//! Error types for medidor
//!
//! One enum covers every failure the harness can hit. The variants split into two
//! groups that the rest of the crate treats differently:
//!
//! - **Fatal**: `Configuration`, `Submission`, `Capacity`. These abort the enclosing
//!   sequence or job before any further work is attempted.
//! - **Recoverable**: `Transport`, `ResponseFormat`, `TelemetryGap`. These are absorbed
//!   where they happen and show up in-band in the output record.

use thiserror::Error;

/// Result type alias for medidor operations
pub type Result<T> = std::result::Result<T, MedidorError>;

/// Error type for all medidor operations
#[derive(Debug, Error)]
pub enum MedidorError {
    /// Malformed device list, bad parameter suffix, unparsable quantization label, bad manifest
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What was wrong with the configuration
        reason: String,
    },

    /// Scheduler did not acknowledge a job submission in the expected form
    #[error("Submission error: {reason}")]
    Submission {
        /// Why the submission is considered failed
        reason: String,
    },

    /// Model footprint plus safety margin exceeds the device memory budget
    #[error(
        "Capacity exceeded: footprint {footprint_gb:.2} GB + margin {margin_gb:.2} GB > budget {budget_gb:.2} GB"
    )]
    Capacity {
        /// Theoretical model footprint in GB
        footprint_gb: f64,
        /// Safety margin in GB
        margin_gb: f64,
        /// Total memory budget across devices in GB
        budget_gb: f64,
    },

    /// HTTP failure or non-2xx status from the inference endpoint
    #[error("Transport error: {0}")]
    Transport(String),

    /// Endpoint body could not be decoded into the expected JSON shape
    #[error("Response format error: {reason}")]
    ResponseFormat {
        /// Description of the decoding failure
        reason: String,
    },

    /// A single device read failed during one sampling tick
    #[error("Telemetry gap on device {device}: {reason}")]
    TelemetryGap {
        /// Device ordinal that failed to read
        device: usize,
        /// Description of the read failure
        reason: String,
    },

    /// I/O failure (result sink, manifest files, sysfs)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure in the result sink
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MedidorError {
    /// Build a configuration error from anything displayable
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Build a submission error from anything displayable
    pub fn submission(reason: impl Into<String>) -> Self {
        Self::Submission {
            reason: reason.into(),
        }
    }

    /// Whether this error must halt the enclosing sequence
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::Submission { .. } | Self::Capacity { .. }
        )
    }
}
