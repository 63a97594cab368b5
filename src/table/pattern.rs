//! Fixed-layout report output, where rows are recognized by a regex.
//!
//! Predictors such as netMHCpan print banners, separators and per-protein
//! summaries around their data rows. Only lines matching the row pattern are
//! kept; each capture group becomes one field.

use super::{ParseError, SchemaParser, Table};
use regex::Regex;

pub struct PatternParser {
    regex: Regex,
    columns: Vec<String>,
}

impl PatternParser {
    /// `pattern` must have exactly one capture group per column.
    pub fn new(pattern: &str, columns: Vec<String>) -> anyhow::Result<Self> {
        let regex = Regex::new(pattern)?;
        let groups = regex.captures_len() - 1;
        if groups != columns.len() {
            anyhow::bail!(
                "Row pattern has {} capture groups but {} columns are declared",
                groups,
                columns.len()
            );
        }
        Ok(Self { regex, columns })
    }
}

impl SchemaParser for PatternParser {
    fn parse(&self, raw: &str) -> Result<Table, ParseError> {
        let mut table = Table::new(self.columns.clone());
        for line in raw.lines() {
            if let Some(caps) = self.regex.captures(line.trim()) {
                let row = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map_or(String::new(), |m| m.as_str().to_string()))
                    .collect();
                table.rows.push(row);
            }
        }
        Ok(table)
    }
}
