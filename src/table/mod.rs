//! Tabular views of raw tool output.
//!
//! The engine does not know what a predictor's columns mean. It only needs a
//! [`SchemaParser`] that turns one job's stdout into a header plus rows, so
//! that partial results can be checked against one shared schema and merged.

mod delimited;
mod pattern;

use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;

pub use delimited::DelimitedParser;
pub use pattern::PatternParser;

/// Header plus data rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }
}

/// Write one tab-separated row. Embedded tabs and newlines become spaces.
pub fn write_tsv_row<W: Write>(out: &mut W, fields: &[String]) -> std::io::Result<()> {
    let line: Vec<String> = fields
        .iter()
        .map(|f| f.replace(['\t', '\n', '\r'], " "))
        .collect();
    writeln!(out, "{}", line.join("\t"))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("output has no header row")]
    MissingHeader,

    #[error("row {line} has {found} fields, expected {expected}")]
    FieldCount {
        line: usize,
        found: usize,
        expected: usize,
    },

    #[error("header {found:?} does not match expected columns {expected:?}")]
    HeaderMismatch {
        found: Vec<String>,
        expected: Vec<String>,
    },
}

/// Converts one tool's raw stdout into a [`Table`].
pub trait SchemaParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Table, ParseError>;
}

/// Parser selection in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserConfig {
    /// First non-comment line is the header; remaining lines are rows.
    Delimited {
        #[serde(default = "default_delimiter")]
        delimiter: String,
        #[serde(default = "default_comment_prefix")]
        comment_prefix: String,
        /// Expected header; checked when set.
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    /// Rows are the lines matching `regex`; capture groups become fields.
    Pattern { regex: String, columns: Vec<String> },
}

fn default_delimiter() -> String {
    "\t".to_string()
}

fn default_comment_prefix() -> String {
    "#".to_string()
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig::Delimited {
            delimiter: default_delimiter(),
            comment_prefix: default_comment_prefix(),
            columns: None,
        }
    }
}

impl ParserConfig {
    /// Build the configured parser.
    pub fn build(&self) -> anyhow::Result<Box<dyn SchemaParser>> {
        match self {
            ParserConfig::Delimited {
                delimiter,
                comment_prefix,
                columns,
            } => {
                if delimiter.is_empty() {
                    anyhow::bail!("Delimited parser needs a non-empty delimiter");
                }
                let mut parser = DelimitedParser::new(delimiter.clone(), comment_prefix.clone());
                if let Some(columns) = columns {
                    parser = parser.with_columns(columns.clone());
                }
                Ok(Box::new(parser))
            }
            ParserConfig::Pattern { regex, columns } => {
                Ok(Box::new(PatternParser::new(regex, columns.clone())?))
            }
        }
    }
}
