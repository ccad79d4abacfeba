//! Per-unit failure history and retry counters.

use std::collections::BTreeMap;

use crate::core::types::{Failure, UnitId};

/// Failure history for one run, keyed by unit id.
///
/// Invariant: `retry_count(u) == failures(u).len()` after every
/// [`FailureTracker::record_failure`].
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    failures: BTreeMap<UnitId, Vec<Failure>>,
    retry_counts: BTreeMap<UnitId, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and stamp its retry count.
    pub fn record_failure(&mut self, mut failure: Failure) -> &Failure {
        let unit_id = failure.unit_id;
        let count = self.retry_counts.entry(unit_id).or_insert(0);
        *count += 1;
        failure.retry_count = *count;

        let history = self.failures.entry(unit_id).or_default();
        history.push(failure);
        &history[history.len() - 1]
    }

    pub fn failures(&self, unit_id: UnitId) -> &[Failure] {
        self.failures
            .get(&unit_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn retry_count(&self, unit_id: UnitId) -> u32 {
        self.retry_counts.get(&unit_id).copied().unwrap_or(0)
    }

    pub fn last_failure(&self, unit_id: UnitId) -> Option<&Failure> {
        self.failures.get(&unit_id).and_then(|history| history.last())
    }

    /// Forget a unit's history. Returns the number of failures dropped.
    pub fn reset(&mut self, unit_id: UnitId) -> u32 {
        self.failures.remove(&unit_id);
        self.retry_counts.remove(&unit_id).unwrap_or(0)
    }

    pub fn total_failures(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }
}
