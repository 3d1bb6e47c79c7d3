//! # Medidor
//!
//! Cluster GPU inference benchmark harness.
//!
//! Medidor (Spanish: "meter, gauge") submits a matrix of benchmark jobs to a batch scheduler,
//! and inside each job drives an Ollama inference endpoint prompt by prompt while a background
//! sampler records accelerator utilization, memory and power for exactly the duration of each
//! request.
//!
//! ## Pipeline
//!
//! ```text
//! JobSequencer ──sbatch──▶ job: CapacityGuard ─▶ BenchmarkRunner (+ TelemetrySampler) ─▶ ResultAggregator ─▶ CSV
//! ```
//!
//! - [`scheduler`]: run matrix, scheduler boundary, job-id chaining
//! - [`capacity`]: theoretical footprint and pre-flight capacity check
//! - [`runner`]: one inference call bracketed by telemetry, throughput
//! - [`telemetry`]: device backends, idle-power gated sampler, per-run aggregates
//! - [`results`]: fixed-width records and the header-once CSV sink
//! - [`job`]: the remote side tying the above together
//!
//! ## Example
//!
//! ```rust
//! use medidor::capacity;
//!
//! let footprint = capacity::estimate_footprint_gb("7B", "Q4_0").unwrap();
//! assert!((footprint - 3.5).abs() < 1e-9);
//!
//! let report = capacity::check(footprint, 2.0, 8.0, 1).unwrap();
//! assert!(report.headroom_gb() > 0.0);
//! ```
//!
//! ## Error Model
//!
//! Configuration, submission and capacity failures are fatal and stop the enclosing sequence.
//! Transport and telemetry failures are absorbed where they happen and appear in-band in the
//! output record (`error: ...` or `N/A`).

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // counters and byte totals to f64
#![allow(clippy::cast_possible_truncation)] // millisecond durations for logging
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests

pub mod capacity;
pub mod config;
pub mod error;
pub mod http_client;
pub mod job;
pub mod manifest;
pub mod results;
pub mod runner;
pub mod scheduler;
pub mod telemetry;

pub use config::BenchConfig;
pub use error::{MedidorError, Result};
pub use http_client::{InferenceEndpoint, OllamaClient};
pub use results::{CsvResultSink, ResultAggregator, RunResult};
pub use runner::{BenchmarkRunner, PromptOutcome, Throughput};
pub use scheduler::{JobSequencer, ScriptScheduler};
pub use telemetry::{TelemetrySampler, TelemetryStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
