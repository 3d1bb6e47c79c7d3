//! Medidor CLI - cluster GPU inference benchmark harness
//!
//! # Commands
//!
//! - `submit` - Submit the run matrix to the batch scheduler (login node)
//! - `job` - Run one model over a prompt list with telemetry (inside a scheduled job)
//! - `probe` - Sample the visible devices for a few seconds and print the aggregates

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use medidor::{
    config::{BenchConfig, DEFAULT_ENDPOINT},
    error::{MedidorError, Result},
    job::{run_job, JobRequest},
    manifest::{parse_prompt_list, RunManifest},
    results::{CsvResultSink, ResultAggregator, UNAVAILABLE},
    runner::{BenchmarkRunner, RunnerConfig},
    scheduler::{JobSequencer, RunMatrix, ScriptScheduler, DEFAULT_JOB_SCRIPT},
    telemetry::{monitor_for, Aggregate, SamplerConfig, TelemetrySampler},
    OllamaClient,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Medidor - benchmark LLM inference on cluster GPUs
#[derive(Parser)]
#[command(name = "medidor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit repetitions × GPU counts × models as chained scheduler jobs
    ///
    /// Examples:
    ///   medidor submit -g 4 -r 3 -p mi210
    ///   medidor submit --dry-run
    Submit {
        /// Highest GPU count; jobs run with 1..=N GPUs
        #[arg(short, long = "gpus", default_value = "1")]
        gpus: usize,

        /// Repetitions of the whole matrix
        #[arg(short, long = "rep", default_value = "1")]
        rep: usize,

        /// Scheduler partition
        #[arg(short, long, default_value = "mi210")]
        partition: String,

        /// Endpoint address (host:port) inside each job
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        port: String,

        /// Job generator script
        #[arg(long, default_value = DEFAULT_JOB_SCRIPT)]
        script: PathBuf,

        /// Models manifest (defaults to MODELS_JSON_PATH)
        #[arg(long)]
        models: Option<PathBuf>,

        /// Prompts manifest (defaults to PROMPTS_JSON_PATH)
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Print the plan without submitting
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one model over a prompt list and append one CSV row per prompt
    ///
    /// Examples:
    ///   medidor job -m llama2 --prompts "[Why is the sky blue?,Hello]"
    Job {
        /// Model identifier
        #[arg(short, long)]
        model: String,

        /// Prompt list in bracketed form: [p1,p2,...]
        #[arg(long)]
        prompts: String,

        /// Endpoint address (host:port)
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        port: String,

        /// GPUs allocated to the job (defaults to the visible device count)
        #[arg(short, long)]
        gpus: Option<usize>,

        /// Weight tag (informational)
        #[arg(short, long)]
        weight: Option<String>,

        /// Predecessor job id (informational, -1 for none)
        #[arg(long = "job_id", allow_hyphen_values = true)]
        job_id: Option<String>,

        /// Do not pull the model when it is missing
        #[arg(long)]
        no_pull: bool,

        /// Request NDJSON streaming responses
        #[arg(long)]
        stream: bool,
    },
    /// Sample the visible devices and print per-device aggregates
    Probe {
        /// Sampling window in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = BenchConfig::from_env()?;

    match cli.command {
        Commands::Submit {
            gpus,
            rep,
            partition,
            port,
            script,
            models,
            prompts,
            dry_run,
        } => {
            let models = models.or_else(|| config.models_path.clone()).ok_or_else(|| {
                MedidorError::config("no models manifest (use --models or MODELS_JSON_PATH)")
            })?;
            let prompts = prompts.or_else(|| config.prompts_path.clone()).ok_or_else(|| {
                MedidorError::config("no prompts manifest (use --prompts or PROMPTS_JSON_PATH)")
            })?;
            let manifest = RunManifest::load(&models, &prompts)?;
            let matrix = RunMatrix::new(manifest)
                .with_repetitions(rep)
                .with_max_gpus(gpus)
                .with_partition(partition)
                .with_port(port);
            submit(matrix, script, dry_run)?;
        },
        Commands::Job {
            model,
            prompts,
            port,
            gpus,
            weight,
            job_id,
            no_pull,
            stream,
        } => {
            info!(
                model = %model,
                weight = weight.as_deref().unwrap_or("-"),
                predecessor = job_id.as_deref().unwrap_or("-1"),
                "starting job"
            );
            let prompts = parse_prompt_list(&prompts);
            if prompts.is_empty() {
                return Err(MedidorError::config("prompt list is empty"));
            }
            let gpu_count = gpus.unwrap_or(config.visible_devices.len());
            let mut request = JobRequest::new(model, prompts, gpu_count);
            if no_pull {
                request = request.without_pull();
            }
            job(&config, &port, stream, &request)?;
        },
        Commands::Probe { seconds } => {
            probe(&config, Duration::from_secs(seconds))?;
        },
    }

    Ok(())
}

fn submit(matrix: RunMatrix, script: PathBuf, dry_run: bool) -> Result<()> {
    let mut sequencer = JobSequencer::new(ScriptScheduler::new(script), matrix)?;

    if dry_run {
        for job in sequencer.plan() {
            println!(
                "rep={} gpus={} partition={} model={} weight={} port={}",
                job.repetition, job.gpu_count, job.partition, job.model, job.weight, job.port
            );
        }
        return Ok(());
    }

    let submitted = sequencer.submit_all()?;
    for entry in &submitted {
        let predecessor = entry
            .job
            .predecessor
            .as_ref()
            .map_or_else(|| "-1".to_string(), ToString::to_string);
        println!(
            "{} <- {} ({} on {} GPU(s), rep {})",
            entry.id, predecessor, entry.job.model, entry.job.gpu_count, entry.job.repetition
        );
    }
    println!("Submitted {} job(s)", submitted.len());
    Ok(())
}

fn job(config: &BenchConfig, port: &str, stream: bool, request: &JobRequest) -> Result<()> {
    let monitor = monitor_for(config)?;
    let client = OllamaClient::new(port, config.request_timeout)?.with_streaming(stream);
    let mut runner = BenchmarkRunner::new(client, monitor, RunnerConfig::from(config));
    let mut sink = CsvResultSink::open(config.result_file(), ResultAggregator::from(config))?;

    let summary = run_job(config, &mut runner, &mut sink, request)?;
    println!(
        "{} record(s) written to {} ({} failed)",
        summary.records,
        sink.path().display(),
        summary.failures
    );
    Ok(())
}

fn probe(config: &BenchConfig, window: Duration) -> Result<()> {
    let monitor = monitor_for(config)?;
    println!(
        "Probing {} device(s) via {} for {}s (gate {:.1} W)",
        monitor.device_count(),
        monitor.name(),
        window.as_secs(),
        config.idle_power_watts
    );

    let mut sampler = TelemetrySampler::new(monitor, SamplerConfig::from(config));
    sampler.start()?;
    std::thread::sleep(window);
    let stats = sampler.get_stats();

    for device in 0..stats.device_count() {
        match stats.slot(device) {
            Some(s) => println!(
                "GPU{device}: samples={} util={} % power={} W vram={} MiB",
                s.samples,
                fmt_aggregate(s.utilization_percent, 1.0),
                fmt_aggregate(s.power_watts, 1.0),
                fmt_aggregate(s.vram_bytes, 1024.0 * 1024.0)
            ),
            None => println!("GPU{device}: {UNAVAILABLE} (idle-power gate never opened)"),
        }
    }
    Ok(())
}

fn fmt_aggregate(aggregate: Aggregate, divisor: f64) -> String {
    format!(
        "avg {:.2} / max {:.2}",
        aggregate.avg / divisor,
        aggregate.max / divisor
    )
}
