//! pMHC Fan-out
//!
//! Parallel fan-out/fan-in execution of external sequence-analysis tools
//! (peptide–MHC binding predictors and similar command-line programs).
//!
//! # Architecture
//!
//! The engine consists of:
//!
//! - **Corpus**: FASTA and peptide-list readers/writers
//! - **Partition**: count-based or length-lane splitting with a shared worker budget
//! - **Pipeline**: bounded concurrent tool invocation, per-job isolation and ordered merge
//! - **Table**: schema-preserving parsers for tool output
//! - **I/O**: object storage fetch/upload and per-request artifact cleanup
//!
//! # Usage
//!
//! ```no_run
//! use pmhc_fanout::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//!     let report = run_pipeline(config, "minio://molly/peptides.fsa").await?;
//!     println!("{}", report.summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod corpus;
pub mod error;
pub mod io;
pub mod partition;
pub mod pipeline;
pub mod table;

pub use config::Config;
pub use corpus::{Corpus, CorpusFormat, SequenceRecord};
pub use error::{JobError, JobFailure, MergeError, PartitionError, PipelineError};
pub use partition::{AllocationTable, Lane, PartitionMode, PartitionPlan};
pub use pipeline::{Delivery, Engine, RunReport, RunSummary};

use anyhow::Result;

/// Run one request with the given configuration.
pub async fn run_pipeline(config: Config, input: &str) -> Result<RunReport> {
    tracing::info!("Starting pMHC fan-out for {}", config.tool.program);
    let engine = Engine::new(config)?;
    Ok(engine.run(input).await?)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
