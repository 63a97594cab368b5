//! Header-plus-rows text output (TSV, CSV and friends).

use super::{ParseError, SchemaParser, Table};

/// Parser for delimiter-separated output with a header line.
pub struct DelimitedParser {
    delimiter: String,
    comment_prefix: String,
    columns: Option<Vec<String>>,
}

impl DelimitedParser {
    pub fn new(delimiter: impl Into<String>, comment_prefix: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
            comment_prefix: comment_prefix.into(),
            columns: None,
        }
    }

    /// Tab-separated with `#` comments.
    pub fn tsv() -> Self {
        Self::new("\t", "#")
    }

    /// Require the header to equal `columns`.
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    fn split(&self, line: &str) -> Vec<String> {
        line.split(self.delimiter.as_str())
            .map(|f| f.trim().to_string())
            .collect()
    }

    fn is_comment(&self, line: &str) -> bool {
        !self.comment_prefix.is_empty() && line.starts_with(self.comment_prefix.as_str())
    }
}

impl SchemaParser for DelimitedParser {
    fn parse(&self, raw: &str) -> Result<Table, ParseError> {
        let mut lines = raw
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty() && !self.is_comment(l.trim_start()));

        let (_, header_line) = lines.next().ok_or(ParseError::MissingHeader)?;
        let header = self.split(header_line);

        if let Some(expected) = &self.columns {
            if &header != expected {
                return Err(ParseError::HeaderMismatch {
                    found: header,
                    expected: expected.clone(),
                });
            }
        }

        let mut table = Table::new(header);
        for (idx, line) in lines {
            let row = self.split(line);
            if row.len() != table.header.len() {
                return Err(ParseError::FieldCount {
                    line: idx + 1,
                    found: row.len(),
                    expected: table.header.len(),
                });
            }
            table.rows.push(row);
        }
        Ok(table)
    }
}
