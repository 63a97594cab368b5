//! Sequence corpora: the labeled records a request operates on.
//!
//! Two on-disk formats are supported, matching what the wrapped predictors
//! accept: FASTA (`>id` header followed by sequence lines) and peptide lists
//! (one peptide per line). A corpus remembers its format so partitions can be
//! written back in the form the tool expects.

mod fasta;
mod peplist;

use anyhow::{Context, Result};
use std::path::Path;

pub use fasta::{parse_fasta, write_fasta};
pub use peplist::{parse_peplist, write_peplist};

/// A single identifier + payload pair. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    pub sequence: String,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence: sequence.into(),
        }
    }

    /// Payload length in residues.
    pub fn len(&self) -> usize {
        self.sequence.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Input file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFormat {
    Fasta,
    PeptideList,
}

impl CorpusFormat {
    /// Detect the format from a file name's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "fa" | "fasta" | "fas" | "fsa" => Some(CorpusFormat::Fasta),
            "txt" | "tsv" | "pep" => Some(CorpusFormat::PeptideList),
            _ => None,
        }
    }

    /// File extension used when materializing partitions.
    pub fn extension(&self) -> &'static str {
        match self {
            CorpusFormat::Fasta => "fsa",
            CorpusFormat::PeptideList => "txt",
        }
    }

    /// Serialize records in this format.
    pub fn render(&self, records: &[SequenceRecord]) -> String {
        match self {
            CorpusFormat::Fasta => write_fasta(records),
            CorpusFormat::PeptideList => write_peplist(records),
        }
    }
}

/// Ordered records loaded once per request.
#[derive(Debug, Clone)]
pub struct Corpus {
    records: Vec<SequenceRecord>,
    format: CorpusFormat,
    /// Entries that could not be parsed (headerless or unterminated).
    malformed: usize,
}

impl Corpus {
    pub fn new(records: Vec<SequenceRecord>, format: CorpusFormat, malformed: usize) -> Self {
        Self {
            records,
            format,
            malformed,
        }
    }

    /// Parse corpus text in the given format.
    pub fn parse(text: &str, format: CorpusFormat) -> Self {
        let (records, malformed) = match format {
            CorpusFormat::Fasta => parse_fasta(text),
            CorpusFormat::PeptideList => parse_peplist(text),
        };
        if malformed > 0 {
            tracing::warn!("Skipped {} malformed corpus entries", malformed);
        }
        Self::new(records, format, malformed)
    }

    /// Read a corpus from a local file, detecting its format from the extension.
    /// Unknown extensions fall back to FASTA when the content starts with `>`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;

        let format = match CorpusFormat::from_path(path) {
            Some(format) => format,
            None if text.trim_start().starts_with('>') => CorpusFormat::Fasta,
            None => anyhow::bail!(
                "Unsupported corpus file type: {} (expected .fa/.fasta/.fas/.fsa or .txt/.tsv)",
                path.display()
            ),
        };

        Ok(Self::parse(&text, format))
    }

    pub fn records(&self) -> &[SequenceRecord] {
        &self.records
    }

    pub fn format(&self) -> CorpusFormat {
        self.format
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
