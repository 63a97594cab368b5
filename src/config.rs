//! Configuration for the fan-out pipeline.

use crate::partition::PartitionMode;
use crate::table::ParserConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for one wrapped tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// External tool invocation
    pub tool: ToolConfig,

    /// How the corpus is split into jobs
    #[serde(default)]
    pub partition: PartitionMode,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Object storage connection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Where the merged result goes
    #[serde(default)]
    pub output: OutputConfig,
}

/// External tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Executable name or path
    pub program: String,

    /// Argument template. `{input}`, `{workdir}`, `{lane}` and `{job}` are
    /// substituted per job.
    #[serde(default)]
    pub args: Vec<String>,

    /// Fixed working directory for every job. Defaults to the job's own
    /// scratch directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// How the partition reaches the tool
    #[serde(default)]
    pub input_via: InputVia,

    /// Where the tool leaves its tabular output
    #[serde(default)]
    pub result: ResultSource,

    /// How raw output is turned into rows
    #[serde(default)]
    pub parser: ParserConfig,
}

/// How the partition file reaches the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputVia {
    /// Path substituted for `{input}` in the arguments.
    #[default]
    Argument,
    /// Partition content piped to stdin.
    Stdin,
}

/// Where a job's raw result is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ResultSource {
    #[default]
    Stdout,
    /// A file the tool writes. Placeholders are expanded and relative paths
    /// resolve against the job's working directory.
    File { name: String },
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Global ceiling on concurrent tool processes. Values <= 0 mean 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: i64,

    /// Per-job hard timeout in seconds; `null` disables it
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: Option<u64>,

    /// Retry configuration for failed jobs
    #[serde(default)]
    pub retry: RetryConfig,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Base directory for per-request scratch space
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl ProcessingConfig {
    /// Concurrency budget with non-positive values coerced to 1.
    pub fn effective_concurrency(&self) -> usize {
        usize::try_from(self.concurrency).unwrap_or(0).max(1)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    /// Directory under which request scratch directories are created.
    pub fn scratch_base(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pmhc-fanout"))
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout_secs(),
            retry: RetryConfig::default(),
            worker_threads: None,
            scratch_dir: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per job, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Object storage connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Serve buckets from subdirectories of this path instead of S3
    #[serde(default)]
    pub local_root: Option<String>,

    /// S3-compatible endpoint URL (MinIO)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,

    /// Skip request signing (public buckets)
    #[serde(default)]
    pub anonymous: bool,

    /// Scheme used in returned result URIs
    #[serde(default = "default_uri_scheme")]
    pub uri_scheme: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_root: None,
            endpoint: None,
            region: default_region(),
            allow_http: false,
            anonymous: false,
            uri_scheme: default_uri_scheme(),
        }
    }
}

/// Merged result delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Bucket to upload the merged result into. When unset the result is
    /// kept in `local_dir`.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Directory for results that are kept locally
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,

    /// Result object name is `{request_id}_{name_suffix}.tsv`
    #[serde(default = "default_name_suffix")]
    pub name_suffix: String,

    /// If upload fails, keep the file locally and return this prefix joined
    /// with the file name
    #[serde(default)]
    pub download_url_prefix: Option<String>,
}

impl OutputConfig {
    /// Object name of the merged result for `request_id`.
    pub fn object_name(&self, request_id: &str) -> String {
        format!("{}_{}.tsv", request_id, self.name_suffix)
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            local_dir: default_local_dir(),
            name_suffix: default_name_suffix(),
            download_url_prefix: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tool.program.trim().is_empty() {
            anyhow::bail!("tool.program must not be empty");
        }
        if self.tool.input_via == InputVia::Argument
            && !self.tool.args.iter().any(|a| a.contains("{input}"))
        {
            anyhow::bail!("tool.args must reference {{input}} unless input_via is stdin");
        }
        if let ResultSource::File { name } = &self.tool.result {
            if name.trim().is_empty() {
                anyhow::bail!("tool.result.name must not be empty");
            }
            // Only the job workdir is private; anywhere else every job would share one file.
            let per_job = name.contains("{workdir}") || name.contains("{job}");
            if !per_job && (self.tool.working_dir.is_some() || Path::new(name).is_absolute()) {
                anyhow::bail!(
                    "tool.result.name '{}' resolves to the same file for every job; include {{workdir}} or {{job}}",
                    name
                );
            }
        }
        self.tool.parser.build()?;

        match &self.partition {
            PartitionMode::Count { worker_count } if *worker_count == 0 => {
                anyhow::bail!("partition.worker_count must be > 0");
            }
            PartitionMode::ByLength { lane_lengths } => {
                if lane_lengths.is_empty() {
                    anyhow::bail!("partition.lane_lengths must not be empty");
                }
                if lane_lengths.contains(&0) {
                    anyhow::bail!("partition.lane_lengths must be > 0");
                }
            }
            _ => {}
        }

        if self.processing.concurrency <= 0 {
            tracing::warn!(
                "processing.concurrency is {}, using 1",
                self.processing.concurrency
            );
        }
        if self.processing.job_timeout_secs == Some(0) {
            anyhow::bail!("processing.job_timeout_secs must be > 0 (use null to disable)");
        }
        if self.processing.retry.max_attempts == 0 {
            anyhow::bail!("processing.retry.max_attempts must be > 0");
        }
        if self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("processing.metrics_interval_secs must be > 0");
        }

        if self.output.name_suffix.is_empty() || self.output.name_suffix.contains('/') {
            anyhow::bail!("output.name_suffix must be a non-empty file name fragment");
        }
        if let Some(bucket) = &self.output.bucket {
            if bucket.is_empty() || bucket.contains('/') {
                anyhow::bail!("output.bucket must be a bare bucket name");
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_concurrency() -> i64 { 4 }
fn default_job_timeout_secs() -> Option<u64> { Some(3600) }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_attempts() -> usize { 1 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_region() -> String { "us-east-1".to_string() }
fn default_uri_scheme() -> String { "minio".to_string() }
fn default_local_dir() -> PathBuf { PathBuf::from(".") }
fn default_name_suffix() -> String { "results".to_string() }
