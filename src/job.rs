//! Remote job: capacity check, then one bracketed run and one record per prompt
//!
//! This is what a scheduled job executes on its node. Fatal errors (capacity, unparsable
//! model metadata, sink failures) end the job before or between prompts; per-prompt transport
//! failures become in-band records and the batch continues.

use tracing::{error, info, warn};

use crate::capacity::{self, CapacityReport};
use crate::config::BenchConfig;
use crate::error::{MedidorError, Result};
use crate::http_client::InferenceEndpoint;
use crate::results::{ModelIdentity, ResultAggregator, ResultSink};
use crate::runner::{BenchmarkRunner, Throughput};
use crate::telemetry::TelemetryStats;

/// Separator printed after each prompt report
const REPORT_SEPARATOR: &str = "------------------------------------------------------------";

/// What one job runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Model identifier
    pub model: String,
    /// Prompts in order
    pub prompts: Vec<String>,
    /// Devices allocated to the job
    pub gpu_count: usize,
    /// Ensure the model is on the server before running
    pub pull_if_missing: bool,
}

impl JobRequest {
    /// Request over `gpu_count` devices, pulling the model if missing
    pub fn new(model: impl Into<String>, prompts: Vec<String>, gpu_count: usize) -> Self {
        Self {
            model: model.into(),
            prompts,
            gpu_count,
            pull_if_missing: true,
        }
    }

    /// Skip the pull-if-missing step
    #[must_use]
    pub fn without_pull(mut self) -> Self {
        self.pull_if_missing = false;
        self
    }
}

/// Totals of a finished job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobSummary {
    /// Records written (one per prompt)
    pub records: usize,
    /// Prompts whose request failed
    pub failures: usize,
    /// Capacity check result; `None` when metadata was unavailable
    pub capacity: Option<CapacityReport>,
}

/// Run one job end to end
///
/// # Errors
/// Returns `Capacity` if the model cannot fit, `Configuration` if its metadata is unparsable,
/// `Io`/`Csv` if the sink fails. Endpoint failures are recorded per prompt instead.
pub fn run_job<E, S>(
    config: &BenchConfig,
    runner: &mut BenchmarkRunner<E>,
    sink: &mut S,
    request: &JobRequest,
) -> Result<JobSummary>
where
    E: InferenceEndpoint,
    S: ResultSink + ?Sized,
{
    let aggregator = ResultAggregator::from(config);
    let model = request.model.as_str();

    let details = if request.pull_if_missing {
        runner.prepare(model)
    } else {
        runner.endpoint().show(model)
    };

    let (identity, capacity) = match details {
        Ok(details) => {
            let footprint = capacity::estimate_footprint_gb(
                &details.parameter_size,
                &details.quantization_level,
            )?;
            let report = capacity::check(
                footprint,
                config.safety_margin_gb,
                config.per_device_vram_gb,
                request.gpu_count,
            )
            .map_err(|e| {
                error!(model, gpus = request.gpu_count, error = %e, "model does not fit");
                e
            })?;
            info!(
                model,
                footprint_gb = report.footprint_gb,
                budget_gb = report.budget_gb,
                headroom_gb = report.headroom_gb(),
                "capacity check passed"
            );
            let identity =
                ModelIdentity::new(model, details.parameter_size, details.quantization_level);
            (identity, Some(report))
        },
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            // Without metadata nothing can run; every prompt still gets its record
            warn!(model, error = %e, "model preparation failed");
            return record_all_failed(&aggregator, sink, request, &e);
        },
    };

    let mut summary = JobSummary {
        records: 0,
        failures: 0,
        capacity,
    };

    for prompt in &request.prompts {
        let outcome = runner.run(model, prompt);
        report(&outcome.prompt, &outcome.throughput);

        if outcome.throughput.is_failed() {
            summary.failures += 1;
        }
        let result = aggregator.record(
            identity.clone(),
            outcome.throughput,
            request.gpu_count,
            &outcome.stats,
        );
        sink.append(&result)?;
        summary.records += 1;
    }

    info!(
        model,
        records = summary.records,
        failures = summary.failures,
        "job finished"
    );
    Ok(summary)
}

fn record_all_failed<S: ResultSink + ?Sized>(
    aggregator: &ResultAggregator,
    sink: &mut S,
    request: &JobRequest,
    cause: &MedidorError,
) -> Result<JobSummary> {
    let message = cause.to_string();
    for prompt in &request.prompts {
        let throughput = Throughput::Failed(message.clone());
        report(prompt, &throughput);
        let result = aggregator.record(
            ModelIdentity::unknown(&request.model),
            throughput,
            request.gpu_count,
            &TelemetryStats::unavailable(request.gpu_count),
        );
        sink.append(&result)?;
    }
    Ok(JobSummary {
        records: request.prompts.len(),
        failures: request.prompts.len(),
        capacity: None,
    })
}

fn report(prompt: &str, throughput: &Throughput) {
    info!("Prompt: {prompt}");
    info!("Tokens/s: {throughput}");
    info!("{REPORT_SEPARATOR}");
}
