//! Peptide lists: one peptide per line, no identifiers.

use super::SequenceRecord;

/// Parse a peptide list. Each record gets a positional id (`pep1`, `pep2`, ...)
/// based on its line among valid peptides. Only the first whitespace-separated
/// token of a line is used; lines whose token is not purely alphabetic are
/// counted as malformed. Blank lines and `#` comments are ignored.
pub fn parse_peplist(text: &str) -> (Vec<SequenceRecord>, usize) {
    let mut records = Vec::new();
    let mut malformed = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let token = line.split_whitespace().next().unwrap_or("");
        if token.chars().all(|c| c.is_ascii_alphabetic()) {
            let id = format!("pep{}", records.len() + 1);
            records.push(SequenceRecord::new(id, token.to_ascii_uppercase()));
        } else {
            malformed += 1;
        }
    }

    (records, malformed)
}

/// Render records as a peptide list. Identifiers are not written.
pub fn write_peplist(records: &[SequenceRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.sequence);
        out.push('\n');
    }
    out
}
