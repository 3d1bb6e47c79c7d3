//! Benchmark runner: one inference call bracketed by telemetry
//!
//! Each [`BenchmarkRunner::run`] builds a fresh [`TelemetrySampler`], starts it right before
//! the request, and stops it as soon as the response has been fully read, on success and on
//! failure alike. `run` takes `&mut self`, so one runner can never have two bracketed calls
//! (and two samplers) in flight.
//!
//! Throughput is `count / (duration / unit_scale)`, with the unit taken from configuration.
//! Zero or negative counters make the throughput unavailable rather than an error.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BenchConfig, DurationUnit, EvalPhase};
use crate::error::Result;
use crate::http_client::{InferenceEndpoint, ModelDetails};
use crate::telemetry::{DeviceMonitor, SamplerConfig, TelemetrySampler, TelemetryStats};

/// Tokens per second of one prompt, or why there is none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Throughput {
    /// Measured throughput
    TokensPerSecond(f64),
    /// Endpoint answered but reported no usable counters
    Unavailable,
    /// The request failed; the message is recorded in-band
    Failed(String),
}

impl Throughput {
    /// Numeric value if measured
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::TokensPerSecond(tps) => Some(*tps),
            Self::Unavailable | Self::Failed(_) => None,
        }
    }

    /// Whether the request failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokensPerSecond(tps) => write!(f, "{tps:.3}"),
            Self::Unavailable => write!(f, "N/A"),
            Self::Failed(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Throughput from an evaluation count and duration
#[must_use]
pub fn compute_throughput(count: i64, duration: i64, unit: DurationUnit) -> Throughput {
    if count <= 0 || duration <= 0 {
        return Throughput::Unavailable;
    }
    let seconds = duration as f64 / unit.per_second();
    Throughput::TokensPerSecond(count as f64 / seconds)
}

/// Result of one bracketed prompt
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOutcome {
    /// Prompt sent
    pub prompt: String,
    /// Throughput or the reason it is missing
    pub throughput: Throughput,
    /// Telemetry recorded while the request was in flight
    pub stats: TelemetryStats,
}

impl PromptOutcome {
    /// Error message if the request failed
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.throughput {
            Throughput::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Runner settings derived from [`BenchConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerConfig {
    /// Sampler parameters for every bracketed call
    pub sampler: SamplerConfig,
    /// Unit of the endpoint's durations
    pub duration_unit: DurationUnit,
    /// Which counters the throughput uses
    pub eval_phase: EvalPhase,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&BenchConfig::default())
    }
}

impl From<&BenchConfig> for RunnerConfig {
    fn from(config: &BenchConfig) -> Self {
        Self {
            sampler: SamplerConfig::from(config),
            duration_unit: config.duration_unit,
            eval_phase: config.eval_phase,
        }
    }
}

/// Ollama tags carry an explicit `:latest` when the caller gave none
fn is_installed(installed: &[String], model: &str) -> bool {
    installed
        .iter()
        .any(|name| name == model || (!model.contains(':') && *name == format!("{model}:latest")))
}

/// Executes inference requests bracketed by telemetry sampling
pub struct BenchmarkRunner<E: InferenceEndpoint> {
    endpoint: E,
    monitor: Arc<dyn DeviceMonitor>,
    config: RunnerConfig,
}

impl<E: InferenceEndpoint> fmt::Debug for BenchmarkRunner<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkRunner")
            .field("backend", &self.monitor.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: InferenceEndpoint> BenchmarkRunner<E> {
    /// Create a runner over an endpoint (already bound to its address) and a device monitor
    #[must_use]
    pub fn new(endpoint: E, monitor: Arc<dyn DeviceMonitor>, config: RunnerConfig) -> Self {
        Self {
            endpoint,
            monitor,
            config,
        }
    }

    /// Endpoint this runner talks to
    #[must_use]
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Runner configuration
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Make sure `model` is on the server, then fetch its metadata
    ///
    /// Pulls only when the tag listing does not show the model; if the listing itself
    /// fails the pull is attempted anyway.
    ///
    /// # Errors
    /// Returns `Transport`/`ResponseFormat` if the pull or show request fails
    pub fn prepare(&self, model: &str) -> Result<ModelDetails> {
        let present = match self.endpoint.list_models() {
            Ok(installed) => is_installed(&installed, model),
            Err(e) => {
                warn!(model, error = %e, "could not list installed models; pulling");
                false
            },
        };

        if present {
            debug!(model, "model already installed");
        } else {
            info!(model, "pulling model");
            self.endpoint.pull(model)?;
        }

        let details = self.endpoint.show(model)?;
        info!(
            model,
            parameter_size = %details.parameter_size,
            quantization_level = %details.quantization_level,
            "model metadata"
        );
        Ok(details)
    }

    /// Send one prompt with telemetry sampling around the request
    ///
    /// Never fails: transport and decoding errors become [`Throughput::Failed`].
    pub fn run(&mut self, model: &str, prompt: &str) -> PromptOutcome {
        let mut sampler = TelemetrySampler::new(Arc::clone(&self.monitor), self.config.sampler);
        if let Err(e) = sampler.start() {
            warn!(error = %e, "telemetry sampler failed to start; stats will be unavailable");
        }

        let response = self.endpoint.generate(model, prompt);
        sampler.stop();
        let stats = sampler.get_stats();

        let throughput = match response {
            Ok(response) => {
                let (count, duration) = response.eval_counters(self.config.eval_phase);
                compute_throughput(count, duration, self.config.duration_unit)
            },
            Err(e) => {
                warn!(model, prompt, error = %e, "inference request failed");
                Throughput::Failed(e.to_string())
            },
        };

        PromptOutcome {
            prompt: prompt.to_string(),
            throughput,
            stats,
        }
    }

    /// Run every prompt in order; one failure does not stop the rest
    pub fn run_batch(&mut self, model: &str, prompts: &[String]) -> Vec<PromptOutcome> {
        prompts.iter().map(|p| self.run(model, p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::error::MedidorError;
    use crate::http_client::GenerateResponse;
    use crate::telemetry::{StubMonitor, StubReading};

    /// Scripted endpoint; each generate pops one response
    struct MockEndpoint {
        responses: Mutex<Vec<Result<GenerateResponse>>>,
        installed: Vec<String>,
        pulls: AtomicUsize,
        details: ModelDetails,
    }

    impl MockEndpoint {
        fn new(responses: Vec<Result<GenerateResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                installed: Vec::new(),
                pulls: AtomicUsize::new(0),
                details: ModelDetails {
                    parameter_size: "7B".to_string(),
                    quantization_level: "Q4_0".to_string(),
                    ..ModelDetails::default()
                },
            }
        }
    }

    impl InferenceEndpoint for MockEndpoint {
        fn generate(&self, _model: &str, _prompt: &str) -> Result<GenerateResponse> {
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or_else(|| Err(MedidorError::Transport("script exhausted".to_string())))
        }

        fn pull(&self, _model: &str) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn show(&self, _model: &str) -> Result<ModelDetails> {
            Ok(self.details.clone())
        }

        fn list_models(&self) -> Result<Vec<String>> {
            Ok(self.installed.clone())
        }
    }

    fn counters(eval_count: i64, eval_duration: i64) -> GenerateResponse {
        GenerateResponse {
            eval_count,
            eval_duration,
            done: true,
            ..GenerateResponse::default()
        }
    }

    fn runner(endpoint: MockEndpoint, unit: DurationUnit) -> BenchmarkRunner<MockEndpoint> {
        let config = RunnerConfig {
            sampler: SamplerConfig::new().with_interval(std::time::Duration::from_millis(1)),
            duration_unit: unit,
            eval_phase: EvalPhase::Generation,
        };
        BenchmarkRunner::new(endpoint, Arc::new(StubMonitor::idle(1)), config)
    }

    #[test]
    fn test_throughput_microseconds() {
        let tps = compute_throughput(100, 2_000_000, DurationUnit::Microseconds);
        assert_eq!(tps, Throughput::TokensPerSecond(50.0));
    }

    #[test]
    fn test_throughput_nanoseconds() {
        let tps = compute_throughput(100, 2_000_000_000, DurationUnit::Nanoseconds);
        assert_eq!(tps.value(), Some(50.0));
    }

    #[test]
    fn test_throughput_zero_or_negative_is_unavailable() {
        for (count, duration) in [(0, 2_000_000), (100, 0), (-1, 10), (10, -1), (0, 0)] {
            assert_eq!(
                compute_throughput(count, duration, DurationUnit::Microseconds),
                Throughput::Unavailable
            );
        }
    }

    #[test]
    fn test_throughput_display() {
        assert_eq!(Throughput::TokensPerSecond(50.0).to_string(), "50.000");
        assert_eq!(Throughput::Unavailable.to_string(), "N/A");
        assert_eq!(
            Throughput::Failed("HTTP 500".to_string()).to_string(),
            "error: HTTP 500"
        );
    }

    #[test]
    fn test_run_computes_throughput_from_response() {
        let endpoint = MockEndpoint::new(vec![Ok(counters(100, 2_000_000))]);
        let mut runner = runner(endpoint, DurationUnit::Microseconds);
        let outcome = runner.run("llama2", "Why is the sky blue?");
        assert_eq!(outcome.prompt, "Why is the sky blue?");
        assert_eq!(outcome.throughput, Throughput::TokensPerSecond(50.0));
        assert!(outcome.error().is_none());
        // Idle stub never opens the gate
        assert!(!outcome.stats.any_available());
    }

    #[test]
    fn test_run_failure_is_in_band() {
        let endpoint = MockEndpoint::new(vec![
            Err(MedidorError::Transport("HTTP 500 from server".to_string())),
            Ok(counters(10, 1_000_000)),
        ]);
        let mut runner = runner(endpoint, DurationUnit::Microseconds);
        let outcomes = runner.run_batch("llama2", &["a".to_string(), "b".to_string()]);

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].throughput.is_failed());
        assert!(outcomes[0].error().expect("error").contains("HTTP 500"));
        assert_eq!(outcomes[1].throughput, Throughput::TokensPerSecond(10.0));
    }

    #[test]
    fn test_run_samples_busy_device() {
        let endpoint = MockEndpoint::new(vec![Ok(counters(1, 1))]);
        let monitor = Arc::new(StubMonitor::constant(1, StubReading::ok(99.0, 1 << 20, 300.0)));

        struct SlowEndpoint(MockEndpoint);
        impl InferenceEndpoint for SlowEndpoint {
            fn generate(&self, model: &str, prompt: &str) -> Result<GenerateResponse> {
                std::thread::sleep(std::time::Duration::from_millis(30));
                self.0.generate(model, prompt)
            }
            fn pull(&self, model: &str) -> Result<()> {
                self.0.pull(model)
            }
            fn show(&self, model: &str) -> Result<ModelDetails> {
                self.0.show(model)
            }
            fn list_models(&self) -> Result<Vec<String>> {
                self.0.list_models()
            }
        }

        let config = RunnerConfig {
            sampler: SamplerConfig::new().with_interval(std::time::Duration::from_millis(1)),
            ..RunnerConfig::default()
        };
        let mut runner = BenchmarkRunner::new(SlowEndpoint(endpoint), monitor.clone(), config);
        let outcome = runner.run("llama2", "hi");

        let summary = outcome.stats.slot(0).expect("gate opened at 300 W");
        assert!((summary.power_watts.max - 300.0).abs() < f64::EPSILON);
        assert_eq!(monitor.begin_calls(), 1);
        assert_eq!(monitor.end_calls(), 1, "sampler stopped before run returned");
    }

    #[test]
    fn test_prepare_pulls_missing_model() {
        let endpoint = MockEndpoint::new(vec![]);
        let runner = runner(endpoint, DurationUnit::Nanoseconds);
        let details = runner.prepare("llama2").expect("prepare");
        assert_eq!(details.parameter_size, "7B");
        assert_eq!(runner.endpoint().pulls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_skips_pull_when_installed() {
        let mut endpoint = MockEndpoint::new(vec![]);
        endpoint.installed = vec!["llama2:latest".to_string()];
        let runner = runner(endpoint, DurationUnit::Nanoseconds);
        runner.prepare("llama2").expect("prepare");
        assert_eq!(runner.endpoint().pulls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_installed_tag_matching() {
        let installed = vec!["llama2:latest".to_string(), "mistral:7b".to_string()];
        assert!(is_installed(&installed, "llama2"));
        assert!(is_installed(&installed, "mistral:7b"));
        assert!(!is_installed(&installed, "mistral"));
        assert!(!is_installed(&installed, "llama2:13b"));
    }
}
