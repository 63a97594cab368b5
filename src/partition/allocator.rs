//! Fair-share worker allocation across lanes.
//!
//! Max-min fairness with deterministic tie-breaking: every non-empty lane gets
//! the same base share of the budget and the remainder goes to the first lanes
//! in declaration order. Degenerate inputs are normalized, never rejected.

use super::Lane;

/// Demand for workers on one lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneDemand {
    pub lane: Lane,
    /// Number of records routed to the lane. Zero marks an empty lane.
    pub records: usize,
    /// Parallelism the lane would use if it had the budget to itself.
    pub desired: usize,
}

impl LaneDemand {
    pub fn new(lane: Lane, records: usize, desired: usize) -> Self {
        Self {
            lane,
            records,
            desired,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Lane → worker count, in lane declaration order.
///
/// Empty lanes are listed with zero workers so callers can report them, but
/// they never produce jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationTable {
    entries: Vec<(Lane, usize)>,
}

impl AllocationTable {
    /// Workers assigned to a lane (0 when absent or empty).
    pub fn workers(&self, lane: &Lane) -> usize {
        self.entries
            .iter()
            .find(|(l, _)| l == lane)
            .map_or(0, |(_, w)| *w)
    }

    /// Sum of assigned workers.
    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    /// All lanes including empty ones.
    pub fn iter(&self) -> impl Iterator<Item = &(Lane, usize)> {
        self.entries.iter()
    }

    /// Lanes that received at least one worker.
    pub fn active(&self) -> impl Iterator<Item = &(Lane, usize)> {
        self.entries.iter().filter(|(_, w)| *w > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl std::fmt::Display for AllocationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(lane, workers)| format!("{}:{}", lane, workers))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Divide `budget` workers across `lanes`.
///
/// - no non-empty lanes: every lane gets 0
/// - one non-empty lane: `min(budget, desired)`, at least 1
/// - at least as many non-empty lanes as budget: 1 each (oversubscribes)
/// - otherwise: `budget / m` each, first `budget % m` lanes get one more
///
/// A budget of 0 is treated as 1.
pub fn allocate(budget: usize, lanes: &[LaneDemand]) -> AllocationTable {
    let budget = budget.max(1);
    let active: Vec<usize> = lanes
        .iter()
        .enumerate()
        .filter(|(_, d)| !d.is_empty())
        .map(|(i, _)| i)
        .collect();
    let m = active.len();

    let mut workers = vec![0usize; lanes.len()];
    match m {
        0 => {}
        1 => {
            let idx = active[0];
            workers[idx] = budget.min(lanes[idx].desired).max(1);
        }
        m if m >= budget => {
            for &idx in &active {
                workers[idx] = 1;
            }
        }
        m => {
            let base = budget / m;
            let remainder = budget % m;
            for (rank, &idx) in active.iter().enumerate() {
                workers[idx] = base + usize::from(rank < remainder);
            }
        }
    }

    AllocationTable {
        entries: lanes
            .iter()
            .zip(workers)
            .map(|(d, w)| (d.lane.clone(), w))
            .collect(),
    }
}
