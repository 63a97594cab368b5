//! FASTA reading and writing.

use super::SequenceRecord;

/// Parse FASTA text into records.
///
/// Returns the records in file order and the number of malformed entries:
/// sequence lines before the first header, headers with no identifier, and
/// headers with no sequence lines (unterminated entries). Multi-line sequences
/// are concatenated and surrounding whitespace is dropped.
pub fn parse_fasta(text: &str) -> (Vec<SequenceRecord>, usize) {
    let mut records = Vec::new();
    let mut malformed = 0;

    let mut current_id: Option<String> = None;
    let mut current_seq = String::new();
    let mut orphan_lines = false;

    let mut finish = |id: Option<String>, seq: &mut String, records: &mut Vec<SequenceRecord>| {
        if let Some(id) = id {
            if id.is_empty() || seq.is_empty() {
                malformed += 1;
            } else {
                records.push(SequenceRecord::new(id, std::mem::take(seq)));
            }
        }
        seq.clear();
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('>') {
            finish(current_id.take(), &mut current_seq, &mut records);
            let id = header.split_whitespace().next().unwrap_or("").to_string();
            current_id = Some(id);
        } else if current_id.is_some() {
            current_seq.push_str(line);
        } else {
            orphan_lines = true;
        }
    }
    finish(current_id.take(), &mut current_seq, &mut records);

    // A block of headerless lines counts as one malformed entry.
    if orphan_lines {
        malformed += 1;
    }

    (records, malformed)
}

/// Render records as FASTA, one sequence line per record.
pub fn write_fasta(records: &[SequenceRecord]) -> String {
    let mut out = String::with_capacity(records.iter().map(|r| r.id.len() + r.sequence.len() + 3).sum());
    for record in records {
        out.push('>');
        out.push_str(&record.id);
        out.push('\n');
        out.push_str(&record.sequence);
        out.push('\n');
    }
    out
}
