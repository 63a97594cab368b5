//! Error taxonomy for the fan-out pipeline.
//!
//! Stage errors are typed so that sibling jobs stay isolated structurally:
//! a [`JobError`] is a value collected next to successful results, never a
//! panic or an early return that would abandon the rest of the request.

use crate::partition::Lane;
use crate::pipeline::FailureEntry;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to turn a corpus into partitions.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The input contained entries but none of them could be parsed.
    #[error("corpus is unparsable: {malformed} malformed entries and no valid records")]
    Unparsable { malformed: usize },

    /// Records were parsed but every one was excluded by lane filtering.
    #[error("no records survive partitioning ({skipped_length} records match no requested length)")]
    NoRecordsSurvive { skipped_length: usize },
}

/// Why a single job failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobFailure {
    /// The executable could not be started.
    #[error("failed to spawn tool: {0}")]
    Spawn(String),

    /// The tool exited unsuccessfully.
    #[error("tool exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The tool did not finish before the per-job deadline and was killed.
    #[error("tool timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// Reading or writing the job's private files failed.
    #[error("job i/o error: {0}")]
    Io(String),

    /// The tool ran but its output does not fit the table schema.
    #[error("unreadable output: {0}")]
    UnreadableOutput(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "signal".to_string(),
    }
}

/// One failed job, carrying the identity of the partition it ran on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job {seq} (lane {lane}, chunk {chunk_index}) failed: {failure}")]
pub struct JobError {
    /// Partition sequence index (submission order).
    pub seq: usize,
    pub lane: Lane,
    pub chunk_index: usize,
    pub failure: JobFailure,
}

impl JobError {
    pub fn new(seq: usize, lane: Lane, chunk_index: usize, failure: JobFailure) -> Self {
        Self {
            seq,
            lane,
            chunk_index,
            failure,
        }
    }

    /// True when the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, JobFailure::Timeout { .. })
    }
}

/// Failure to produce a merged table.
#[derive(Debug, Error)]
pub enum MergeError {
    /// No partial result parsed, so there is no header to keep.
    #[error(
        "no partial results available to establish a schema ({failed} of {attempted} jobs failed){}",
        failure_list(.failures)
    )]
    NoSchema {
        attempted: usize,
        failed: usize,
        failures: Vec<FailureEntry>,
    },

    /// The request was cancelled while merging.
    #[error("merge interrupted")]
    Interrupted,

    #[error("failed to write merged result {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn failure_list(failures: &[FailureEntry]) -> String {
    failures
        .iter()
        .map(|f| format!("\n  job {} (lane {}, chunk {}): {}", f.seq, f.lane, f.chunk_index, f.reason))
        .collect()
}

/// A transient artifact that could not be removed. Logged, never escalated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not remove {path}: {message}")]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Request-level failure surfaced to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load input: {0:#}")]
    Fetch(anyhow::Error),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("failed to upload merged result: {0:#}")]
    Upload(anyhow::Error),

    #[error("request was cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
