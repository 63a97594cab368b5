//! pMHC Fan-out CLI
//!
//! Runs an external sequence-analysis tool over an input corpus in parallel.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pmhc_fanout::{build_runtime, Config, Engine};

#[derive(Parser)]
#[command(name = "pmhc-fanout")]
#[command(about = "Fan a sequence-analysis tool out over a peptide corpus", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true, allow_negative_numbers = true)]
    concurrency: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one input corpus (local path or minio://bucket/key)
    Run { input: String },

    /// Show how the input would be partitioned without running the tool
    Plan { input: String },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input } => run_command(cli.config, cli.concurrency, &input),
        Commands::Plan { input } => plan_command(cli.config, cli.concurrency, &input),
        Commands::Validate => validate_command(cli.config),
        Commands::GenerateConfig { output } => generate_config_command(output),
    }
}

fn load_config(config_path: &Path, concurrency: Option<i64>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, concurrency: Option<i64>, input: &str) -> Result<()> {
    let config = load_config(&config_path, concurrency)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(async {
        let engine = Engine::new(config)?;
        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_err() {
                // No signal handler available: never cancel.
                std::future::pending::<()>().await;
            }
        };
        anyhow::Ok(engine.run_until(input, shutdown).await?)
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn plan_command(config_path: PathBuf, concurrency: Option<i64>, input: &str) -> Result<()> {
    let config = load_config(&config_path, concurrency)?;
    let runtime = build_runtime(None)?;

    runtime.block_on(async {
        let engine = Engine::new(config)?;
        let plan = engine.plan(input).await?;

        println!("\n=== Partition Plan ===");
        println!("Records parsed: {}", plan.total_records);
        println!("Records dispatched: {}", plan.dispatched_records());
        println!("Skipped (no lane): {}", plan.skipped_length);
        println!("Skipped (malformed): {}", plan.skipped_malformed);
        println!("Allocation: {}", plan.allocation);
        println!("Jobs: {}", plan.partitions.len());
        for partition in &plan.partitions {
            println!(
                "  job {:>4}  lane {:>4}  chunk {:>3}  {} records",
                partition.seq,
                partition.lane,
                partition.chunk_index,
                partition.len()
            );
        }
        println!("======================\n");

        Ok(())
    })
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r##"# pMHC Fan-out Configuration

# === TOOL: The external program run once per partition ===
tool:
  program: "netMHCpan"

  # Placeholders: {input} partition file, {workdir} private job directory,
  # {lane} peptide length (or "all"), {job} job sequence number
  args: ["-p", "{input}", "-a", "HLA-B07:02", "-l", "{lane}", "-xls", "-xlsfile", "{workdir}/out.xls"]

  # Run the tool in this directory instead of the job directory
  # working_dir: "/opt/netMHCpan"

  # How the partition reaches the tool: argument ({input}) or stdin
  input_via: argument

  # Where the tool writes its table: stdout, or a file (placeholders allowed)
  result:
    from: file
    name: "{workdir}/out.xls"

  # How to read the tool's table
  parser:
    kind: delimited
    delimiter: "\t"
    comment_prefix: "#"
    # columns: ["Pos", "Peptide", "ID", "Score"]

# === PARTITION: How the corpus is split ===
# mode: count splits records into worker_count even chunks.
# mode: by_length routes peptides into one lane per length.
partition:
  mode: by_length
  lane_lengths: [8, 9, 10, 11]

# === PROCESSING: Concurrency and fault handling ===
processing:
  # Worker budget shared by all lanes (values <= 0 run one worker)
  concurrency: 4

  # Kill a job after this many seconds (null = no limit)
  job_timeout_secs: 3600

  retry:
    # Total attempts per job (1 = no retry)
    max_attempts: 1
    initial_backoff_ms: 500
    max_backoff_ms: 10000

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Parent directory for per-request scratch space (default: system temp)
  # scratch_dir: "/var/tmp/pmhc-fanout"

  # Print progress metrics during processing
  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

# === STORAGE: Object store for minio:// inputs and uploads ===
storage:
  # Serve buckets from a local directory instead of S3/MinIO
  # local_root: "/srv/buckets"

  endpoint: "http://localhost:9000"
  region: "us-east-1"
  allow_http: true
  anonymous: false
  uri_scheme: "minio"

# === OUTPUT: Where the merged table goes ===
output:
  # Upload to this bucket; omit to keep the table in local_dir
  bucket: "results"

  local_dir: "."

  # Object name is <request-id>_<name_suffix>.tsv
  name_suffix: "NetMHCpan_results"

  # When upload fails, keep the table in local_dir and link here instead
  # download_url_prefix: "http://localhost:8080/results"
"##;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
