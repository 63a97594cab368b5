//! Corpus partitioning along record count and payload length.
//!
//! A [`PartitionPlan`] is computed up front for the whole request: records are
//! routed to lanes, the allocator decides how many workers each lane gets, and
//! each lane is count-split into that many partitions. Partition sequence
//! numbers follow lane declaration order then chunk order, and the merger uses
//! them to restore submission order.

pub mod allocator;

use crate::corpus::{Corpus, SequenceRecord};
use crate::error::PartitionError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use allocator::{allocate, AllocationTable, LaneDemand};

/// Dispatch grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    /// Every record (count mode).
    All,
    /// Records whose payload has exactly this length.
    Length(usize),
}

impl Lane {
    /// Placeholder value substituted for `{lane}` in command templates.
    pub fn label(&self) -> String {
        match self {
            Lane::All => "all".to_string(),
            Lane::Length(len) => len.to_string(),
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Lane {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// How the corpus is split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PartitionMode {
    /// Even record-count chunks.
    Count {
        #[serde(default = "default_worker_count")]
        worker_count: usize,
    },
    /// One lane per required peptide length.
    ByLength { lane_lengths: Vec<usize> },
}

fn default_worker_count() -> usize {
    4
}

impl Default for PartitionMode {
    fn default() -> Self {
        PartitionMode::Count {
            worker_count: default_worker_count(),
        }
    }
}

/// A materializable subset of the corpus assigned to exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Global sequence index; defines merge order.
    pub seq: usize,
    pub lane: Lane,
    /// Position of this chunk within its lane.
    pub chunk_index: usize,
    pub records: Vec<SequenceRecord>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Split `records` into at most `k` chunks of as-even-as-possible size.
///
/// Chunks hold at most `ceil(n / k)` records; the first `n % k` chunks take
/// the extra record. Order is preserved within and across chunks. When
/// `n < k` the surplus chunks are absent rather than empty.
pub fn split_by_count(records: &[SequenceRecord], k: usize) -> Vec<Vec<SequenceRecord>> {
    let n = records.len();
    if n == 0 {
        return Vec::new();
    }
    let k = k.clamp(1, n);
    let base = n / k;
    let remainder = n % k;

    let mut chunks = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let size = base + usize::from(i < remainder);
        chunks.push(records[start..start + size].to_vec());
        start += size;
    }
    chunks
}

/// Records grouped by declared lane length.
#[derive(Debug, Clone, Default)]
pub struct LengthGroups {
    /// Lanes in declaration order (duplicates removed), each with its records.
    pub lanes: Vec<(usize, Vec<SequenceRecord>)>,
    /// Records whose length matches no lane.
    pub skipped: usize,
}

/// Route each record to the lane matching its payload length.
pub fn group_by_length(records: &[SequenceRecord], lengths: &[usize]) -> LengthGroups {
    let mut seen = HashSet::new();
    let mut lanes: Vec<(usize, Vec<SequenceRecord>)> = lengths
        .iter()
        .filter(|len| seen.insert(**len))
        .map(|&len| (len, Vec::new()))
        .collect();

    let mut skipped = 0;
    for record in records {
        let len = record.len();
        match lanes.iter_mut().find(|(l, _)| *l == len) {
            Some((_, group)) => group.push(record.clone()),
            None => skipped += 1,
        }
    }

    LengthGroups { lanes, skipped }
}

/// The full partitioning of one request.
#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    pub partitions: Vec<Partition>,
    pub allocation: AllocationTable,
    /// Records excluded because their length matched no lane.
    pub skipped_length: usize,
    /// Entries the corpus reader could not parse.
    pub skipped_malformed: usize,
    /// Records parsed from the input.
    pub total_records: usize,
}

impl PartitionPlan {
    /// Build the plan for `corpus` under `mode` with a worker `budget`.
    ///
    /// An empty input yields an empty plan. Input that had entries but leaves
    /// nothing to dispatch is an error.
    pub fn build(corpus: &Corpus, mode: &PartitionMode, budget: usize) -> Result<Self, PartitionError> {
        if corpus.is_empty() {
            if corpus.malformed() > 0 {
                return Err(PartitionError::Unparsable {
                    malformed: corpus.malformed(),
                });
            }
            return Ok(Self::default());
        }

        let (groups, skipped_length): (Vec<(Lane, Vec<SequenceRecord>)>, usize) = match mode {
            PartitionMode::Count { worker_count } => {
                let lane = (Lane::All, corpus.records().to_vec());
                let demand = (*worker_count).max(1);
                return Ok(Self::assemble(vec![lane], &[demand], budget, 0, corpus));
            }
            PartitionMode::ByLength { lane_lengths } => {
                let grouped = group_by_length(corpus.records(), lane_lengths);
                let lanes = grouped
                    .lanes
                    .into_iter()
                    .map(|(len, records)| (Lane::Length(len), records))
                    .collect();
                (lanes, grouped.skipped)
            }
        };

        if skipped_length > 0 {
            tracing::warn!(
                "{} of {} records match no requested length and were skipped",
                skipped_length,
                corpus.len()
            );
        }

        if groups.iter().all(|(_, records)| records.is_empty()) {
            return Err(PartitionError::NoRecordsSurvive { skipped_length });
        }

        let desired: Vec<usize> = groups.iter().map(|(_, records)| records.len()).collect();
        Ok(Self::assemble(groups, &desired, budget, skipped_length, corpus))
    }

    fn assemble(
        groups: Vec<(Lane, Vec<SequenceRecord>)>,
        desired: &[usize],
        budget: usize,
        skipped_length: usize,
        corpus: &Corpus,
    ) -> Self {
        let demands: Vec<LaneDemand> = groups
            .iter()
            .zip(desired)
            .map(|((lane, records), &want)| LaneDemand::new(lane.clone(), records.len(), want))
            .collect();
        let allocation = allocate(budget, &demands);

        let mut partitions = Vec::new();
        for (lane, records) in groups {
            let workers = allocation.workers(&lane);
            if workers == 0 {
                continue;
            }
            for (chunk_index, chunk) in split_by_count(&records, workers).into_iter().enumerate() {
                partitions.push(Partition {
                    seq: partitions.len(),
                    lane: lane.clone(),
                    chunk_index,
                    records: chunk,
                });
            }
        }

        Self {
            partitions,
            allocation,
            skipped_length,
            skipped_malformed: corpus.malformed(),
            total_records: corpus.len(),
        }
    }

    /// Records routed into partitions.
    pub fn dispatched_records(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl std::fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Records: {}, Dispatched: {}, Skipped (length): {}, Skipped (malformed): {}, Partitions: {}, Allocation: {}",
            self.total_records,
            self.dispatched_records(),
            self.skipped_length,
            self.skipped_malformed,
            self.partitions.len(),
            self.allocation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusFormat;

    fn records(n: usize) -> Vec<SequenceRecord> {
        (0..n)
            .map(|i| SequenceRecord::new(format!("r{}", i), "SIINFEKL"))
            .collect()
    }

    fn corpus_of(seqs: &[&str]) -> Corpus {
        let records = seqs
            .iter()
            .enumerate()
            .map(|(i, s)| SequenceRecord::new(format!("r{}", i), *s))
            .collect();
        Corpus::new(records, CorpusFormat::Fasta, 0)
    }

    #[test]
    fn test_split_ten_by_three() {
        let chunks = split_by_count(&records(10), 3);
        let sizes: Vec<_> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn test_split_fewer_records_than_workers() {
        let chunks = split_by_count(&records(2), 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_split_zero_workers_is_one_chunk() {
        assert_eq!(split_by_count(&records(7), 0).len(), 1);
    }

    #[test]
    fn test_split_completeness() {
        for n in 0..40 {
            let input = records(n);
            for k in 1..12 {
                let chunks = split_by_count(&input, k);
                assert!(chunks.len() <= k);
                assert!(chunks.iter().all(|c| !c.is_empty()));
                let rejoined: Vec<_> = chunks.into_iter().flatten().collect();
                assert_eq!(rejoined, input, "n={} k={}", n, k);
            }
        }
    }

    #[test]
    fn test_group_by_length_exhaustive() {
        let corpus = corpus_of(&["AAAAAAAA", "CCCCCCCC", "DDDDDDDDD", "EEEEEEEEEEE", "FFFFF"]);
        let groups = group_by_length(corpus.records(), &[8, 9, 10, 11, 9]);

        let lane_sizes: Vec<_> = groups.lanes.iter().map(|(l, r)| (*l, r.len())).collect();
        assert_eq!(lane_sizes, vec![(8, 2), (9, 1), (10, 0), (11, 1)]);
        assert_eq!(groups.skipped, 1);

        let placed: usize = groups.lanes.iter().map(|(_, r)| r.len()).sum();
        assert_eq!(placed + groups.skipped, corpus.len());
    }

    #[test]
    fn test_plan_count_mode() {
        let corpus = Corpus::new(records(10), CorpusFormat::Fasta, 0);
        let plan = PartitionPlan::build(&corpus, &PartitionMode::Count { worker_count: 3 }, 8).unwrap();

        assert_eq!(plan.allocation.workers(&Lane::All), 3);
        let sizes: Vec<_> = plan.partitions.iter().map(Partition::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        let seqs: Vec<_> = plan.partitions.iter().map(|p| p.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(plan.dispatched_records(), 10);
    }

    #[test]
    fn test_plan_count_mode_budget_limits_workers() {
        let corpus = Corpus::new(records(10), CorpusFormat::Fasta, 0);
        let plan = PartitionPlan::build(&corpus, &PartitionMode::Count { worker_count: 8 }, 2).unwrap();
        assert_eq!(plan.partitions.len(), 2);
    }

    #[test]
    fn test_plan_by_length_skips_empty_lane() {
        let corpus = corpus_of(&["AAAAAAAA", "CCCCCCCC", "DDDDDDDDD", "EEEEEEEEEEE"]);
        let mode = PartitionMode::ByLength {
            lane_lengths: vec![8, 9, 10, 11],
        };
        let plan = PartitionPlan::build(&corpus, &mode, 4).unwrap();

        assert!(plan.partitions.iter().all(|p| p.lane != Lane::Length(10)));
        assert_eq!(plan.allocation.workers(&Lane::Length(10)), 0);
        assert_eq!(plan.dispatched_records(), 4);

        // Lane 8 has two records and two workers; sequence numbers run across lanes.
        let layout: Vec<_> = plan
            .partitions
            .iter()
            .map(|p| (p.seq, p.lane.clone(), p.chunk_index, p.len()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (0, Lane::Length(8), 0, 1),
                (1, Lane::Length(8), 1, 1),
                (2, Lane::Length(9), 0, 1),
                (3, Lane::Length(11), 0, 1),
            ]
        );
    }

    #[test]
    fn test_plan_reports_length_skips() {
        let corpus = corpus_of(&["AAAAAAAA", "CCCCC"]);
        let mode = PartitionMode::ByLength { lane_lengths: vec![8] };
        let plan = PartitionPlan::build(&corpus, &mode, 2).unwrap();
        assert_eq!(plan.skipped_length, 1);
        assert_eq!(plan.dispatched_records() + plan.skipped_length, plan.total_records);
    }

    #[test]
    fn test_plan_empty_corpus_is_empty() {
        let corpus = Corpus::new(Vec::new(), CorpusFormat::Fasta, 0);
        let plan = PartitionPlan::build(&corpus, &PartitionMode::default(), 4).unwrap();
        assert!(plan.is_empty());
        assert!(plan.allocation.is_empty());
    }

    #[test]
    fn test_plan_all_malformed_is_unparsable() {
        let corpus = Corpus::new(Vec::new(), CorpusFormat::Fasta, 3);
        let err = PartitionPlan::build(&corpus, &PartitionMode::default(), 4).unwrap_err();
        assert!(matches!(err, PartitionError::Unparsable { malformed: 3 }));
    }

    #[test]
    fn test_plan_no_survivors() {
        let corpus = corpus_of(&["AAAA", "CCCCC"]);
        let mode = PartitionMode::ByLength { lane_lengths: vec![9, 10] };
        let err = PartitionPlan::build(&corpus, &mode, 4).unwrap_err();
        assert!(matches!(err, PartitionError::NoRecordsSurvive { skipped_length: 2 }));
    }

    #[test]
    fn test_partition_mode_yaml() {
        let mode: PartitionMode = serde_yaml::from_str("mode: by_length\nlane_lengths: [8, 9]\n").unwrap();
        assert_eq!(mode, PartitionMode::ByLength { lane_lengths: vec![8, 9] });

        let mode: PartitionMode = serde_yaml::from_str("mode: count\n").unwrap();
        assert_eq!(mode, PartitionMode::Count { worker_count: 4 });
    }
}
