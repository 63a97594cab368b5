//! Per-partition job execution.
//!
//! A job writes its partition to a private input file, runs the tool in a
//! private working directory, and leaves the raw output in a partial result
//! file. Every path it creates is registered with the request's
//! [`ArtifactRegistry`] before anything is written to it.

use crate::config::{Config, InputVia, ResultSource, RetryConfig};
use crate::corpus::CorpusFormat;
use crate::error::{JobError, JobFailure};
use crate::io::{ArtifactKind, ArtifactRegistry};
use crate::partition::{Lane, Partition};
use crate::pipeline::invoker::{CommandTemplate, InvocationOutput, InvocationRequest, ToolInvoker};
use crate::pipeline::Metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Output of one successful job, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    pub seq: usize,
    pub lane: Lane,
    pub chunk_index: usize,
    /// Raw tool output.
    pub path: PathBuf,
    /// Records the job was given.
    pub records: usize,
}

/// Per-request job settings derived from the configuration.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub template: CommandTemplate,
    pub working_dir: Option<PathBuf>,
    pub input_via: InputVia,
    pub result: ResultSource,
    pub timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            template: CommandTemplate::new(config.tool.program.clone(), config.tool.args.clone()),
            working_dir: config.tool.working_dir.clone(),
            input_via: config.tool.input_via,
            result: config.tool.result.clone(),
            timeout: config.processing.job_timeout(),
            retry: config.processing.retry.clone(),
        }
    }
}

/// Runs partitions through the tool.
pub struct JobRunner {
    invoker: Arc<dyn ToolInvoker>,
    registry: Arc<ArtifactRegistry>,
    metrics: Arc<Metrics>,
    settings: JobSettings,
    format: CorpusFormat,
}

impl JobRunner {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        registry: Arc<ArtifactRegistry>,
        metrics: Arc<Metrics>,
        settings: JobSettings,
        format: CorpusFormat,
    ) -> Self {
        Self {
            invoker,
            registry,
            metrics,
            settings,
            format,
        }
    }

    /// Run one partition to a terminal state.
    pub async fn run(&self, partition: Partition) -> Result<PartialResult, JobError> {
        match self.run_inner(&partition).await {
            Ok(partial) => {
                self.metrics.add_job_succeeded();
                tracing::debug!(
                    "Job {} (lane {}) finished: {} records -> {}",
                    partial.seq,
                    partial.lane,
                    partial.records,
                    partial.path.display()
                );
                Ok(partial)
            }
            Err(failure) => {
                let err = JobError::new(partition.seq, partition.lane, partition.chunk_index, failure);
                self.metrics.add_job_failed(err.is_timeout());
                tracing::warn!("{}", err);
                Err(err)
            }
        }
    }

    async fn run_inner(&self, partition: &Partition) -> Result<PartialResult, JobFailure> {
        let seq = partition.seq;
        let io_err = |e: std::io::Error| JobFailure::Io(e.to_string());

        let workdir = self
            .registry
            .create_dir(ArtifactKind::JobWorkdir, &format!("job-{:04}", seq))
            .map_err(io_err)?;

        let input = self.registry.file_path(
            ArtifactKind::Partition,
            &format!("partition-{:04}.{}", seq, self.format.extension()),
        );
        let content = self.format.render(&partition.records);
        tokio::fs::write(&input, content.as_bytes()).await.map_err(io_err)?;
        self.metrics.add_records_dispatched(partition.len() as u64);

        let cwd = self.settings.working_dir.clone().unwrap_or_else(|| workdir.clone());
        let request = InvocationRequest {
            program: self.settings.template.program().to_string(),
            args: self.settings.template.expand(&input, &workdir, &partition.lane, seq),
            cwd: cwd.clone(),
            stdin: match self.settings.input_via {
                InputVia::Stdin => Some(content.into_bytes()),
                InputVia::Argument => None,
            },
            timeout: self.settings.timeout,
        };

        let output = self.invoke_with_retry(seq, request).await?;
        self.metrics.add_output_bytes(output.stdout.len() as u64);

        let path = match &self.settings.result {
            ResultSource::Stdout => {
                let path = self
                    .registry
                    .file_path(ArtifactKind::Partial, &format!("partial-{:04}.out", seq));
                tokio::fs::write(&path, &output.stdout).await.map_err(io_err)?;
                path
            }
            ResultSource::File { name } => {
                let expanded = CommandTemplate::expand_one(name, &input, &workdir, &partition.lane, seq);
                let path = resolve(&cwd, &expanded);
                self.registry.register_file(&path, ArtifactKind::Partial);
                if !tokio::fs::try_exists(&path).await.map_err(io_err)? {
                    return Err(JobFailure::UnreadableOutput(format!(
                        "result file {} was not created",
                        path.display()
                    )));
                }
                path
            }
        };

        Ok(PartialResult {
            seq,
            lane: partition.lane.clone(),
            chunk_index: partition.chunk_index,
            path,
            records: partition.len(),
        })
    }

    /// Invoke the tool, retrying failed attempts with exponential backoff.
    async fn invoke_with_retry(&self, seq: usize, request: InvocationRequest) -> Result<InvocationOutput, JobFailure> {
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let max_backoff = self.settings.retry.max_backoff_ms;
        let mut backoff = self.settings.retry.initial_backoff_ms;
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let result = self.invoker.invoke(request.clone()).await;
            self.metrics.add_process_time(started.elapsed());

            let failure = match result {
                Ok(output) if output.success() => return Ok(output),
                Ok(output) => JobFailure::NonZeroExit {
                    code: output.exit_code,
                    stderr: output.stderr_lossy(),
                },
                Err(failure) => failure,
            };

            attempt += 1;
            if attempt >= max_attempts {
                return Err(failure);
            }

            tracing::warn!(
                "Job {} attempt {} failed: {}, retrying in {}ms",
                seq,
                attempt,
                failure,
                backoff
            );
            self.metrics.add_retry();
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }
}

fn resolve(cwd: &Path, name: &str) -> PathBuf {
    let path = PathBuf::from(name);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}
