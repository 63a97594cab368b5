//! Fan-in of partial results into one table.
//!
//! Partial results are visited in partition sequence order. The first one
//! that parses fixes the header; every later one must produce the same header
//! and only contributes data rows. A partial that cannot be read, parsed, or
//! whose header disagrees counts as a failed job, so the summary always says
//! which partitions are missing from the merged rows.

use crate::error::{JobError, JobFailure, MergeError};
use crate::partition::Lane;
use crate::pipeline::job::PartialResult;
use crate::table::{write_tsv_row, SchemaParser};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One job that contributed no rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub seq: usize,
    pub lane: Lane,
    pub chunk_index: usize,
    pub reason: String,
}

impl From<&JobError> for FailureEntry {
    fn from(err: &JobError) -> Self {
        Self {
            seq: err.seq,
            lane: err.lane.clone(),
            chunk_index: err.chunk_index,
            reason: err.failure.to_string(),
        }
    }
}

/// Attempted versus succeeded jobs, with diagnostics for the failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<FailureEntry>,
    /// Records excluded before dispatch (no matching lane).
    pub skipped_records: usize,
    /// Corpus entries that could not be parsed.
    pub malformed_records: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Jobs: {} attempted, {} succeeded, {} failed | Records skipped: {}, malformed: {}",
            self.attempted, self.succeeded, self.failed, self.skipped_records, self.malformed_records
        )
    }
}

/// The combined table of one request.
#[derive(Debug)]
pub struct MergedResult {
    /// Merged TSV file; `None` when no schema could be established.
    pub path: Option<PathBuf>,
    pub header: Vec<String>,
    pub row_count: usize,
    pub summary: RunSummary,
    /// Set when no usable table could be produced.
    pub error: Option<MergeError>,
}

impl MergedResult {
    /// Result for a request that dispatched nothing.
    pub fn empty(summary: RunSummary) -> Self {
        Self {
            path: None,
            header: Vec::new(),
            row_count: 0,
            summary,
            error: None,
        }
    }

    /// True when some jobs contributed nothing.
    pub fn is_partial(&self) -> bool {
        self.summary.failed > 0
    }
}

/// Merges partial results under one schema.
pub struct ResultMerger {
    parser: Arc<dyn SchemaParser>,
}

impl ResultMerger {
    pub fn new(parser: Arc<dyn SchemaParser>) -> Self {
        Self { parser }
    }

    /// Merge job outcomes into `dest`.
    ///
    /// Never fails outright: if no partial yields a schema, the result is
    /// empty and carries [`MergeError::NoSchema`]. Once `cancel` is set the
    /// merge stops before the next partial and reports
    /// [`MergeError::Interrupted`].
    pub fn merge(
        &self,
        mut outcomes: Vec<Result<PartialResult, JobError>>,
        dest: &Path,
        mut summary: RunSummary,
        cancel: &AtomicBool,
    ) -> MergedResult {
        outcomes.sort_by_key(|outcome| match outcome {
            Ok(partial) => partial.seq,
            Err(err) => err.seq,
        });

        summary.attempted = outcomes.len();
        let mut header: Option<Vec<String>> = None;
        let mut writer: Option<BufWriter<File>> = None;
        let mut row_count = 0;
        let mut write_error: Option<std::io::Error> = None;

        for outcome in outcomes {
            if cancel.load(Ordering::Relaxed) {
                tracing::debug!("Merge into {} interrupted", dest.display());
                return MergedResult {
                    error: Some(MergeError::Interrupted),
                    ..MergedResult::empty(summary)
                };
            }
            let partial = match outcome {
                Ok(partial) => partial,
                Err(err) => {
                    summary.failures.push(FailureEntry::from(&err));
                    continue;
                }
            };

            let table = match self.read_partial(&partial, header.as_deref()) {
                Ok(table) => table,
                Err(failure) => {
                    tracing::warn!("Discarding output of job {}: {}", partial.seq, failure);
                    let err = JobError::new(partial.seq, partial.lane, partial.chunk_index, failure);
                    summary.failures.push(FailureEntry::from(&err));
                    continue;
                }
            };
            summary.succeeded += 1;

            if write_error.is_some() {
                continue;
            }
            if writer.is_none() {
                match open_with_header(dest, &table.header) {
                    Ok(w) => writer = Some(w),
                    Err(e) => {
                        write_error = Some(e);
                        continue;
                    }
                }
                header = Some(table.header.clone());
            }
            if let Some(out) = writer.as_mut() {
                for row in &table.rows {
                    if let Err(e) = write_tsv_row(out, row) {
                        write_error = Some(e);
                        break;
                    }
                }
                row_count += table.rows.len();
            }
        }

        summary.failed = summary.failures.len();

        if let Some(mut out) = writer {
            if write_error.is_none() {
                write_error = out.flush().err();
            }
        }

        if let Some(source) = write_error {
            return MergedResult {
                path: None,
                header: Vec::new(),
                row_count: 0,
                summary,
                error: Some(MergeError::Io {
                    path: dest.to_path_buf(),
                    source,
                }),
            };
        }

        match header {
            Some(header) => {
                tracing::info!("Merged {} rows: {}", row_count, summary);
                MergedResult {
                    path: Some(dest.to_path_buf()),
                    header,
                    row_count,
                    summary,
                    error: None,
                }
            }
            None => {
                let error = MergeError::NoSchema {
                    attempted: summary.attempted,
                    failed: summary.failed,
                    failures: summary.failures.clone(),
                };
                MergedResult {
                    error: Some(error),
                    ..MergedResult::empty(summary)
                }
            }
        }
    }

    fn read_partial(
        &self,
        partial: &PartialResult,
        expected: Option<&[String]>,
    ) -> Result<crate::table::Table, JobFailure> {
        let bytes = std::fs::read(&partial.path).map_err(|e| JobFailure::Io(e.to_string()))?;
        let raw = String::from_utf8_lossy(&bytes);
        let table = self
            .parser
            .parse(&raw)
            .map_err(|e| JobFailure::UnreadableOutput(e.to_string()))?;

        if let Some(expected) = expected {
            if table.header != expected {
                return Err(JobFailure::UnreadableOutput(format!(
                    "header {:?} differs from {:?}",
                    table.header, expected
                )));
            }
        }
        Ok(table)
    }
}

fn open_with_header(dest: &Path, header: &[String]) -> std::io::Result<BufWriter<File>> {
    let mut out = BufWriter::new(File::create(dest)?);
    write_tsv_row(&mut out, header)?;
    Ok(out)
}
