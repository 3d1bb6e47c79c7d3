//! Run-matrix submission with best-effort job chaining
//!
//! [`JobSequencer`] walks repetitions (outermost), GPU counts `1..=G`, then models (innermost),
//! and hands one [`BenchmarkJob`] per cell to a [`Scheduler`]. The id parsed from each
//! acknowledgment becomes the predecessor of the next job.
//!
//! Chaining is ordering only: a failed remote job does not cancel the jobs queued behind it.
//! A submission that cannot be acknowledged stops the sequence; nothing after it is submitted.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::DEFAULT_ENDPOINT;
use crate::error::{MedidorError, Result};
use crate::manifest::{format_prompt_list, RunManifest};

/// Acknowledgment pattern printed by `sbatch`
pub const JOB_ID_PATTERN: &str = r"Submitted batch job ([0-9]+)";

/// Generator script invoked per job by default
pub const DEFAULT_JOB_SCRIPT: &str = "./sbatch_generator.sh";

/// Predecessor value sent when a job has none
const NO_PREDECESSOR: &str = "-1";

/// Scheduler-assigned job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Wrap an identifier string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cell of the run matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkJob {
    /// Zero-based repetition index
    pub repetition: usize,
    /// Devices requested for the job
    pub gpu_count: usize,
    /// Scheduler partition
    pub partition: String,
    /// Model identifier
    pub model: String,
    /// Weight tag
    pub weight: String,
    /// Prompts run by the job, in order
    pub prompts: Vec<String>,
    /// Job this one is queued behind
    pub predecessor: Option<JobId>,
    /// Endpoint address (`host:port`) inside the job
    pub port: String,
}

/// A job the scheduler accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    /// Job as submitted, predecessor included
    pub job: BenchmarkJob,
    /// Id parsed from the acknowledgment
    pub id: JobId,
}

/// Cluster scheduler boundary
pub trait Scheduler {
    /// Submit `job` and return the scheduler's textual acknowledgment
    ///
    /// # Errors
    /// Returns `Submission` if the submission command cannot run or fails
    fn submit(&mut self, job: &BenchmarkJob) -> Result<String>;
}

/// Submits jobs by running the generator script
#[derive(Debug, Clone)]
pub struct ScriptScheduler {
    program: PathBuf,
}

impl Default for ScriptScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_SCRIPT)
    }
}

impl ScriptScheduler {
    /// Scheduler that runs `program` once per job
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Script path
    #[must_use]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Command-line arguments for `job`
    ///
    /// # Errors
    /// Returns `Configuration` if the prompts cannot be encoded for the script
    pub fn args(job: &BenchmarkJob) -> Result<Vec<String>> {
        let predecessor = job
            .predecessor
            .as_ref()
            .map_or(NO_PREDECESSOR, JobId::as_str);
        Ok(vec![
            "-p".to_string(),
            job.partition.clone(),
            format!("--gpus={}", job.gpu_count),
            "-m".to_string(),
            job.model.clone(),
            format!("--prompts={}", format_prompt_list(&job.prompts)?),
            "-w".to_string(),
            job.weight.clone(),
            format!("--job_id={predecessor}"),
            format!("--port={}", job.port),
        ])
    }
}

impl Scheduler for ScriptScheduler {
    fn submit(&mut self, job: &BenchmarkJob) -> Result<String> {
        let output = Command::new(&self.program)
            .args(Self::args(job)?)
            .output()
            .map_err(|e| {
                MedidorError::submission(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MedidorError::submission(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts job ids from scheduler acknowledgments
#[derive(Debug, Clone)]
pub struct JobIdParser {
    pattern: Regex,
}

impl JobIdParser {
    /// Parser for [`JOB_ID_PATTERN`]
    ///
    /// # Errors
    /// Returns `Configuration` if the pattern does not compile
    pub fn new() -> Result<Self> {
        Self::with_pattern(JOB_ID_PATTERN)
    }

    /// Parser for a custom pattern whose first capture group is the id
    ///
    /// # Errors
    /// Returns `Configuration` if the pattern does not compile
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| MedidorError::config(format!("invalid job-id pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Id in `acknowledgment`
    ///
    /// # Errors
    /// Returns `Submission` if the acknowledgment does not contain the pattern
    pub fn parse(&self, acknowledgment: &str) -> Result<JobId> {
        self.pattern
            .captures(acknowledgment)
            .and_then(|caps| caps.get(1))
            .map(|m| JobId::new(m.as_str()))
            .ok_or_else(|| {
                MedidorError::submission(format!(
                    "no job id in scheduler acknowledgment: '{}'",
                    acknowledgment.trim()
                ))
            })
    }
}

/// Extract the job id from `"Submitted batch job <digits>"`
///
/// # Errors
/// Returns `Submission` if the phrase is missing
pub fn parse_job_id(acknowledgment: &str) -> Result<JobId> {
    JobIdParser::new()?.parse(acknowledgment)
}

/// Dimensions of the run matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMatrix {
    /// Repetitions of the whole matrix
    pub repetitions: usize,
    /// Highest GPU count; counts run `1..=max_gpus`
    pub max_gpus: usize,
    /// Scheduler partition
    pub partition: String,
    /// Endpoint address inside every job
    pub port: String,
    /// Models and prompts
    pub manifest: RunManifest,
}

impl RunMatrix {
    /// Matrix with one repetition on one GPU over `manifest`
    #[must_use]
    pub fn new(manifest: RunManifest) -> Self {
        Self {
            repetitions: 1,
            max_gpus: 1,
            partition: "mi210".to_string(),
            port: DEFAULT_ENDPOINT.to_string(),
            manifest,
        }
    }

    /// Set repetition count
    #[must_use]
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the highest GPU count
    #[must_use]
    pub fn with_max_gpus(mut self, max_gpus: usize) -> Self {
        self.max_gpus = max_gpus;
        self
    }

    /// Set the partition
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Set the endpoint address
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Number of cells
    #[must_use]
    pub fn len(&self) -> usize {
        self.repetitions * self.max_gpus * self.manifest.models.len()
    }

    /// Whether the matrix has no cells
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the matrix can be submitted
    ///
    /// # Errors
    /// Returns `Configuration` for zero repetitions or GPUs, or an invalid manifest
    pub fn validate(&self) -> Result<()> {
        if self.repetitions == 0 {
            return Err(MedidorError::config("repetition count must be at least 1"));
        }
        if self.max_gpus == 0 {
            return Err(MedidorError::config("GPU count must be at least 1"));
        }
        self.manifest.validate()?;
        format_prompt_list(&self.manifest.prompts)?;
        Ok(())
    }
}

/// Submits a run matrix through a [`Scheduler`]
pub struct JobSequencer<S: Scheduler> {
    scheduler: S,
    matrix: RunMatrix,
    parser: JobIdParser,
}

impl<S: Scheduler> fmt::Debug for JobSequencer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSequencer")
            .field("matrix", &self.matrix)
            .finish_non_exhaustive()
    }
}

impl<S: Scheduler> JobSequencer<S> {
    /// Sequencer over a validated matrix
    ///
    /// # Errors
    /// Returns `Configuration` if the matrix is invalid
    pub fn new(scheduler: S, matrix: RunMatrix) -> Result<Self> {
        matrix.validate()?;
        Ok(Self {
            scheduler,
            matrix,
            parser: JobIdParser::new()?,
        })
    }

    /// The scheduler
    #[must_use]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Jobs in submission order, without predecessors
    #[must_use]
    pub fn plan(&self) -> Vec<BenchmarkJob> {
        let m = &self.matrix;
        let mut jobs = Vec::with_capacity(m.len());
        for repetition in 0..m.repetitions {
            for gpu_count in 1..=m.max_gpus {
                for model in &m.manifest.models {
                    jobs.push(BenchmarkJob {
                        repetition,
                        gpu_count,
                        partition: m.partition.clone(),
                        model: model.name.clone(),
                        weight: model.weight.clone(),
                        prompts: m.manifest.prompts.clone(),
                        predecessor: None,
                        port: m.port.clone(),
                    });
                }
            }
        }
        jobs
    }

    /// Submit every job in order, chaining each to the previous id
    ///
    /// # Errors
    /// Returns `Submission` on the first job that fails or is not acknowledged; no later job
    /// is submitted
    pub fn submit_all(&mut self) -> Result<Vec<SubmittedJob>> {
        let mut submitted = Vec::with_capacity(self.matrix.len());
        let mut predecessor: Option<JobId> = None;

        for mut job in self.plan() {
            job.predecessor = predecessor.take();

            let id = self
                .scheduler
                .submit(&job)
                .and_then(|ack| self.parser.parse(&ack))
                .map_err(|e| {
                    error!(
                        model = %job.model,
                        gpus = job.gpu_count,
                        repetition = job.repetition,
                        submitted = submitted.len(),
                        error = %e,
                        "submission failed; aborting sequence"
                    );
                    e
                })?;

            info!(
                job_id = %id,
                predecessor = job.predecessor.as_ref().map_or(NO_PREDECESSOR, JobId::as_str),
                model = %job.model,
                gpus = job.gpu_count,
                repetition = job.repetition,
                "submitted job"
            );

            predecessor = Some(id.clone());
            submitted.push(SubmittedJob { job, id });
        }
        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ModelSpec;

    /// Records submissions and replies from a script of acknowledgments
    struct ScriptedScheduler {
        replies: Vec<Result<String>>,
        seen: Vec<BenchmarkJob>,
    }

    impl ScriptedScheduler {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: replies.into_iter().rev().collect(),
                seen: Vec::new(),
            }
        }

        fn acking(ids: std::ops::Range<u32>) -> Self {
            Self::new(ids.map(|i| Ok(format!("Submitted batch job {i}\n"))).collect())
        }
    }

    impl Scheduler for ScriptedScheduler {
        fn submit(&mut self, job: &BenchmarkJob) -> Result<String> {
            self.seen.push(job.clone());
            self.replies
                .pop()
                .unwrap_or_else(|| Err(MedidorError::submission("script exhausted")))
        }
    }

    fn manifest(models: &[&str]) -> RunManifest {
        RunManifest {
            models: models.iter().map(|m| ModelSpec::new(*m, "7b")).collect(),
            prompts: vec!["Why is the sky blue?".to_string(), "Hello".to_string()],
        }
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id("Submitted batch job 12345").expect("id"),
            JobId::new("12345")
        );
        assert_eq!(
            parse_job_id("sbatch: note\nSubmitted batch job 7\n").expect("id").as_str(),
            "7"
        );
    }

    #[test]
    fn test_parse_job_id_missing_phrase() {
        for ack in ["", "sbatch: error: invalid partition", "Submitted batch job abc"] {
            let err = parse_job_id(ack).expect_err(ack);
            assert!(matches!(err, MedidorError::Submission { .. }), "{ack}");
        }
    }

    #[test]
    fn test_parse_job_id_ascii_digits_only() {
        let err = parse_job_id("Submitted batch job \u{0661}\u{0662}\u{0663}")
            .expect_err("non-ASCII digits");
        assert!(matches!(err, MedidorError::Submission { .. }));
    }

    #[test]
    fn test_plan_order() {
        let matrix = RunMatrix::new(manifest(&["a", "b"]))
            .with_repetitions(2)
            .with_max_gpus(2);
        let sequencer =
            JobSequencer::new(ScriptedScheduler::new(vec![]), matrix).expect("valid matrix");
        let cells: Vec<(usize, usize, String)> = sequencer
            .plan()
            .into_iter()
            .map(|j| (j.repetition, j.gpu_count, j.model))
            .collect();

        let expected: Vec<(usize, usize, String)> = [
            (0, 1, "a"),
            (0, 1, "b"),
            (0, 2, "a"),
            (0, 2, "b"),
            (1, 1, "a"),
            (1, 1, "b"),
            (1, 2, "a"),
            (1, 2, "b"),
        ]
        .iter()
        .map(|(r, g, m)| (*r, *g, (*m).to_string()))
        .collect();
        assert_eq!(cells, expected);
    }

    #[test]
    fn test_submit_all_chains_predecessors() {
        let matrix = RunMatrix::new(manifest(&["a", "b"])).with_max_gpus(2);
        let mut sequencer =
            JobSequencer::new(ScriptedScheduler::acking(100..104), matrix).expect("valid");
        let submitted = sequencer.submit_all().expect("all acknowledged");

        assert_eq!(submitted.len(), 4);
        assert!(submitted[0].job.predecessor.is_none());
        for pair in submitted.windows(2) {
            assert_eq!(pair[1].job.predecessor.as_ref(), Some(&pair[0].id));
        }
        assert_eq!(submitted[3].id.as_str(), "103");
    }

    #[test]
    fn test_unparsable_ack_halts_sequence() {
        let scheduler = ScriptedScheduler::new(vec![
            Ok("Submitted batch job 1".to_string()),
            Ok("sbatch: error: Batch job submission failed".to_string()),
            Ok("Submitted batch job 3".to_string()),
        ]);
        let matrix = RunMatrix::new(manifest(&["a", "b", "c"]));
        let mut sequencer = JobSequencer::new(scheduler, matrix).expect("valid");

        let err = sequencer.submit_all().expect_err("second ack unparsable");
        assert!(err.is_fatal());
        assert_eq!(sequencer.scheduler().seen.len(), 2, "third job never submitted");
    }

    #[test]
    fn test_scheduler_failure_halts_sequence() {
        let scheduler = ScriptedScheduler::new(vec![Err(MedidorError::submission("exit 1"))]);
        let matrix = RunMatrix::new(manifest(&["a", "b"]));
        let mut sequencer = JobSequencer::new(scheduler, matrix).expect("valid");
        assert!(sequencer.submit_all().is_err());
        assert_eq!(sequencer.scheduler().seen.len(), 1);
    }

    #[test]
    fn test_invalid_matrix_rejected() {
        let zero_gpus = RunMatrix::new(manifest(&["a"])).with_max_gpus(0);
        assert!(JobSequencer::new(ScriptedScheduler::new(vec![]), zero_gpus).is_err());

        let zero_reps = RunMatrix::new(manifest(&["a"])).with_repetitions(0);
        assert!(JobSequencer::new(ScriptedScheduler::new(vec![]), zero_reps).is_err());
    }

    #[test]
    fn test_script_args() {
        let job = BenchmarkJob {
            repetition: 0,
            gpu_count: 2,
            partition: "mi210".to_string(),
            model: "llama2".to_string(),
            weight: "7b".to_string(),
            prompts: vec!["a".to_string(), "b".to_string()],
            predecessor: None,
            port: "127.0.0.1:11434".to_string(),
        };
        let args = ScriptScheduler::args(&job).expect("args");
        assert_eq!(
            args,
            [
                "-p",
                "mi210",
                "--gpus=2",
                "-m",
                "llama2",
                "--prompts=[a,b]",
                "-w",
                "7b",
                "--job_id=-1",
                "--port=127.0.0.1:11434"
            ]
        );

        let chained = BenchmarkJob {
            predecessor: Some(JobId::new("42")),
            ..job
        };
        let args = ScriptScheduler::args(&chained).expect("args");
        assert!(args.contains(&"--job_id=42".to_string()));
    }

    #[test]
    fn test_script_scheduler_missing_program() {
        let mut scheduler = ScriptScheduler::new("/nonexistent/sbatch_generator.sh");
        let job = BenchmarkJob {
            repetition: 0,
            gpu_count: 1,
            partition: "mi210".to_string(),
            model: "llama2".to_string(),
            weight: "7b".to_string(),
            prompts: vec!["a".to_string()],
            predecessor: None,
            port: "127.0.0.1:11434".to_string(),
        };
        let err = scheduler.submit(&job).expect_err("no such program");
        assert!(matches!(err, MedidorError::Submission { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_script_scheduler_passes_args_and_checks_exit() {
        let matrix = RunMatrix::new(manifest(&["llama2"]));
        let plan = JobSequencer::new(ScriptedScheduler::new(vec![]), matrix)
            .expect("valid")
            .plan();

        // echo acknowledges nothing but proves the argument vector reaches the program
        let ack = ScriptScheduler::new("echo").submit(&plan[0]).expect("echo runs");
        assert!(ack.contains("--gpus=1 -m llama2"));
        assert!(parse_job_id(&ack).is_err());

        let err = ScriptScheduler::new("false")
            .submit(&plan[0])
            .expect_err("non-zero exit");
        assert!(matches!(err, MedidorError::Submission { .. }));
    }
}
