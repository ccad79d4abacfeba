//! Iteration budgets, the run deadline, and per-unit deferral decisions.
//!
//! Budgets are the backpressure against an agent that loops on an
//! intractable unit. Deferral is independent of whether the last iteration
//! succeeded: an agent can report success while making no progress.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::budget::remaining_until;
use crate::core::types::{Complexity, DeferReason, UnitId};

/// Words in a description that suggest the unit will balloon.
const COMPLEXITY_KEYWORDS: &[&str] = &[
    "refactor",
    "integration",
    "security",
    "comprehensive",
    "multi",
    "migrate",
    "migration",
    "architecture",
    "distributed",
    "concurrent",
    "authentication",
    "performance",
];

/// Scope limits for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    /// 0 means unlimited.
    pub max_iterations_per_feature: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub auto_defer: bool,
}

/// Per-unit scope record. Created on first observation and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureScope {
    pub id: UnitId,
    pub iterations_used: u32,
    pub complexity: Complexity,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub deferred: bool,
    pub defer_reason: Option<DeferReason>,
    pub simplification_suggested: bool,
}

/// Snapshot for end-of-run summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeStatus {
    pub total_iterations: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub deadline_passed: bool,
    pub remaining_time_secs: Option<u64>,
    pub iterations_by_feature: BTreeMap<UnitId, u32>,
    pub deferred: Vec<UnitId>,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeManager {
    constraints: Constraints,
    features: BTreeMap<UnitId, FeatureScope>,
    total_iterations: u32,
}

impl ScopeManager {
    pub fn new(constraints: Constraints) -> Self {
        Self {
            constraints,
            features: BTreeMap::new(),
            total_iterations: 0,
        }
    }

    /// Start tracking a unit. Existing scopes are left untouched.
    pub fn start_feature(&mut self, id: UnitId, step_count: usize, description: &str) -> &FeatureScope {
        self.features.entry(id).or_insert_with(|| FeatureScope {
            id,
            iterations_used: 0,
            complexity: estimate_complexity(step_count, description),
            start_time: Utc::now(),
            end_time: None,
            deferred: false,
            defer_reason: None,
            simplification_suggested: false,
        })
    }

    pub fn feature(&self, id: UnitId) -> Option<&FeatureScope> {
        self.features.get(&id)
    }

    pub fn record_iteration(&mut self, id: UnitId) {
        self.start_feature(id, 0, "");
        if let Some(scope) = self.features.get_mut(&id) {
            scope.iterations_used += 1;
        }
        self.total_iterations += 1;
    }

    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    pub fn should_defer(&self, id: UnitId) -> Option<DeferReason> {
        self.should_defer_at(id, Utc::now())
    }

    /// Deadline first, then the per-unit iteration limit. Unset limits never defer.
    pub fn should_defer_at(&self, id: UnitId, now: DateTime<Utc>) -> Option<DeferReason> {
        if self.deadline_passed_at(now) {
            return Some(DeferReason::Deadline);
        }
        let limit = self.constraints.max_iterations_per_feature;
        let used = self.features.get(&id).map_or(0, |scope| scope.iterations_used);
        if limit > 0 && used >= limit {
            return Some(DeferReason::IterationLimit);
        }
        None
    }

    /// Mark a unit deferred. Repeated calls keep the first reason.
    pub fn defer_feature(&mut self, id: UnitId, reason: DeferReason) {
        self.start_feature(id, 0, "");
        if let Some(scope) = self.features.get_mut(&id)
            && !scope.deferred
        {
            scope.deferred = true;
            scope.defer_reason = Some(reason);
            scope.end_time = Some(Utc::now());
        }
    }

    pub fn complete_feature(&mut self, id: UnitId) {
        if let Some(scope) = self.features.get_mut(&id)
            && scope.end_time.is_none()
        {
            scope.end_time = Some(Utc::now());
        }
    }

    /// True at most once per unit: immediately for high complexity, or once
    /// half of the per-unit iteration limit has been used.
    pub fn should_suggest_simplification(&mut self, id: UnitId) -> bool {
        let limit = self.constraints.max_iterations_per_feature;
        let Some(scope) = self.features.get_mut(&id) else {
            return false;
        };
        if scope.simplification_suggested {
            return false;
        }
        let over_half = limit > 0 && scope.iterations_used.saturating_mul(2) >= limit;
        if scope.complexity == Complexity::High || over_half {
            scope.simplification_suggested = true;
            return true;
        }
        false
    }

    /// `None` when the per-unit limit is unlimited.
    pub fn remaining_iterations(&self, id: UnitId) -> Option<u32> {
        let limit = self.constraints.max_iterations_per_feature;
        if limit == 0 {
            return None;
        }
        let used = self.features.get(&id).map_or(0, |scope| scope.iterations_used);
        Some(limit.saturating_sub(used))
    }

    /// `None` when no deadline is set.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.constraints
            .deadline
            .map(|deadline| remaining_until(deadline, Utc::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline_passed_at(Utc::now())
    }

    fn deadline_passed_at(&self, now: DateTime<Utc>) -> bool {
        self.constraints
            .deadline
            .is_some_and(|deadline| now >= deadline)
    }

    pub fn deferred_features(&self) -> Vec<UnitId> {
        self.features
            .values()
            .filter(|scope| scope.deferred)
            .map(|scope| scope.id)
            .collect()
    }

    pub fn status(&self) -> ScopeStatus {
        ScopeStatus {
            total_iterations: self.total_iterations,
            deadline: self.constraints.deadline,
            deadline_passed: self.deadline_passed(),
            remaining_time_secs: self.remaining_time().map(|left| left.as_secs()),
            iterations_by_feature: self
                .features
                .values()
                .map(|scope| (scope.id, scope.iterations_used))
                .collect(),
            deferred: self.deferred_features(),
        }
    }
}

/// ≤2 steps low, 3–6 medium, ≥7 high; one level up for risky wording.
pub fn estimate_complexity(step_count: usize, description: &str) -> Complexity {
    let base = match step_count {
        0..=2 => Complexity::Low,
        3..=6 => Complexity::Medium,
        _ => Complexity::High,
    };
    let lower = description.to_lowercase();
    if COMPLEXITY_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
    {
        base.bump()
    } else {
        base
    }
}
