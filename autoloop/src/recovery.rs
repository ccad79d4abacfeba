//! Failure recovery: classify agent output, record the failure, and choose
//! between retrying, skipping, and rolling back.
//!
//! The [`RecoveryManager`] owns the [`FailureTracker`] for a run. Strategy
//! choice is a pure function of the configured default, the failure type and
//! the unit's retry count ([`select_strategy`]); the chosen [`Strategy`] then
//! produces a [`RecoveryResult`] for the loop to act on.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify;
use crate::core::guidance::{retry_guidance, rollback_guidance};
use crate::core::tracker::FailureTracker;
use crate::core::types::{Failure, FailureType, RecoveryResult, RecoveryStrategyKind, UnitId};
use crate::io::git::WorkingTree;

/// Pick the strategy for a failure that has already been recorded.
///
/// Exhausted retries always skip. A rollback default only rolls back for
/// failures that imply broken code and falls back to retry otherwise.
pub fn select_strategy(
    default: RecoveryStrategyKind,
    failure_type: FailureType,
    retry_count: u32,
    max_retries: u32,
) -> RecoveryStrategyKind {
    if retry_count >= max_retries {
        return RecoveryStrategyKind::Skip;
    }
    match default {
        RecoveryStrategyKind::Rollback if failure_type.touches_code() => {
            RecoveryStrategyKind::Rollback
        }
        RecoveryStrategyKind::Rollback => RecoveryStrategyKind::Retry,
        other => other,
    }
}

/// Retry the unit with guidance until its retries run out.
#[derive(Debug, Clone, Copy)]
pub struct RetryStrategy {
    pub max_retries: u32,
}

impl RetryStrategy {
    pub fn apply(&self, failure: &Failure, tracker: &FailureTracker) -> RecoveryResult {
        let attempts = tracker.retry_count(failure.unit_id);
        if attempts >= self.max_retries {
            return RecoveryResult {
                success: false,
                message: format!(
                    "unit #{} exhausted {} retries",
                    failure.unit_id, self.max_retries
                ),
                should_skip: true,
                ..RecoveryResult::default()
            };
        }
        RecoveryResult {
            success: true,
            message: format!(
                "retrying unit #{} after {} ({} of {})",
                failure.unit_id, failure.failure_type, attempts, self.max_retries
            ),
            should_retry: true,
            modified_prompt: Some(retry_guidance(failure, self.max_retries)),
            ..RecoveryResult::default()
        }
    }
}

/// Give up on the unit for the rest of the run.
#[derive(Debug, Clone, Copy)]
pub struct SkipStrategy;

impl SkipStrategy {
    pub fn apply(&self, failure: &Failure, tracker: &FailureTracker) -> RecoveryResult {
        let failures = tracker.failures(failure.unit_id).len();
        RecoveryResult {
            success: true,
            message: format!(
                "skipping unit #{} after {} failure(s)",
                failure.unit_id, failures
            ),
            should_skip: true,
            ..RecoveryResult::default()
        }
    }
}

/// Discard uncommitted tracked changes, then retry from the last commit.
#[derive(Debug, Clone, Copy)]
pub struct RollbackStrategy<'a, W: WorkingTree> {
    pub max_retries: u32,
    pub working_tree: &'a W,
}

impl<W: WorkingTree> RollbackStrategy<'_, W> {
    pub fn apply(&self, failure: &Failure, tracker: &FailureTracker) -> RecoveryResult {
        match self.working_tree.is_work_tree() {
            Ok(true) => {}
            Ok(false) => return rollback_unavailable(failure, "not a git work tree"),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "work tree check failed");
                return rollback_unavailable(failure, "work tree check failed");
            }
        }

        match self.working_tree.has_uncommitted_changes() {
            Ok(true) => {}
            Ok(false) => {
                debug!(unit_id = failure.unit_id, "nothing to roll back");
                return RetryStrategy {
                    max_retries: self.max_retries,
                }
                .apply(failure, tracker);
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "status check failed");
                return rollback_unavailable(failure, "status check failed");
            }
        }

        if let Err(err) = self.working_tree.discard_tracked_changes() {
            warn!(err = %format!("{err:#}"), "rollback failed");
            return rollback_unavailable(failure, "discarding changes failed");
        }

        info!(unit_id = failure.unit_id, "rolled back uncommitted changes");
        RecoveryResult {
            success: true,
            message: format!(
                "rolled back changes for unit #{} after {}",
                failure.unit_id, failure.failure_type
            ),
            should_retry: true,
            modified_prompt: Some(rollback_guidance(failure, self.max_retries)),
            ..RecoveryResult::default()
        }
    }
}

fn rollback_unavailable(failure: &Failure, reason: &str) -> RecoveryResult {
    RecoveryResult {
        success: false,
        message: format!("cannot roll back unit #{}: {reason}", failure.unit_id),
        should_skip: true,
        ..RecoveryResult::default()
    }
}

/// The strategy chosen for one failure.
#[derive(Debug, Clone, Copy)]
pub enum Strategy<'a, W: WorkingTree> {
    Retry(RetryStrategy),
    Skip(SkipStrategy),
    Rollback(RollbackStrategy<'a, W>),
}

impl<W: WorkingTree> Strategy<'_, W> {
    pub fn kind(&self) -> RecoveryStrategyKind {
        match self {
            Strategy::Retry(_) => RecoveryStrategyKind::Retry,
            Strategy::Skip(_) => RecoveryStrategyKind::Skip,
            Strategy::Rollback(_) => RecoveryStrategyKind::Rollback,
        }
    }

    pub fn apply(&self, failure: &Failure, tracker: &FailureTracker) -> RecoveryResult {
        match self {
            Strategy::Retry(strategy) => strategy.apply(failure, tracker),
            Strategy::Skip(strategy) => strategy.apply(failure, tracker),
            Strategy::Rollback(strategy) => strategy.apply(failure, tracker),
        }
    }
}

/// Per-run recovery state and policy.
#[derive(Debug)]
pub struct RecoveryManager<W: WorkingTree> {
    default_strategy: RecoveryStrategyKind,
    max_retries: u32,
    tracker: FailureTracker,
    working_tree: W,
}

impl<W: WorkingTree> RecoveryManager<W> {
    pub fn new(default_strategy: RecoveryStrategyKind, max_retries: u32, working_tree: W) -> Self {
        Self {
            default_strategy,
            max_retries,
            tracker: FailureTracker::new(),
            working_tree,
        }
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    /// Classify one agent run and, if it failed, record and recover from it.
    ///
    /// Returns the recorded failure (with its retry count stamped) alongside
    /// the recovery decision. Only the failing unit's history is touched.
    #[instrument(skip_all, fields(unit_id = unit_id, iteration = iteration))]
    pub fn handle_failure(
        &mut self,
        output: &str,
        exit_code: i32,
        unit_id: UnitId,
        iteration: u32,
    ) -> (Option<Failure>, RecoveryResult) {
        let Some(failure) = classify(output, exit_code, unit_id, iteration) else {
            return (None, RecoveryResult::no_failure());
        };
        let (failure, result) = self.recover(failure);
        (Some(failure), result)
    }

    /// Record an `agent_error` the loop detected itself (not from output)
    /// and recover from it like any classified failure.
    #[instrument(skip_all, fields(unit_id = unit_id, iteration = iteration))]
    pub fn handle_agent_error(
        &mut self,
        message: String,
        output: &str,
        unit_id: UnitId,
        iteration: u32,
    ) -> (Failure, RecoveryResult) {
        self.recover(Failure {
            failure_type: FailureType::AgentError,
            message,
            output: output.to_string(),
            unit_id,
            iteration,
            timestamp: Utc::now(),
            retry_count: 0,
        })
    }

    fn recover(&mut self, failure: Failure) -> (Failure, RecoveryResult) {
        let failure = self.tracker.record_failure(failure).clone();

        let strategy = self.strategy_for(&failure);
        let result = strategy.apply(&failure, &self.tracker);
        info!(
            failure_type = %failure.failure_type,
            retry_count = failure.retry_count,
            strategy = %strategy.kind(),
            should_retry = result.should_retry,
            should_skip = result.should_skip,
            "recovered from failure"
        );
        (failure, result)
    }

    /// Clear the unit's history after a successful iteration. Returns the
    /// number of failures the unit recovered from.
    pub fn record_success(&mut self, unit_id: UnitId) -> u32 {
        let recovered = self.tracker.reset(unit_id);
        if recovered > 0 {
            debug!(unit_id, recovered, "unit recovered");
        }
        recovered
    }

    /// Forget a unit's history, e.g. after a replan reshaped it.
    pub fn reset_unit(&mut self, unit_id: UnitId) {
        self.tracker.reset(unit_id);
    }

    fn strategy_for(&self, failure: &Failure) -> Strategy<'_, W> {
        match select_strategy(
            self.default_strategy,
            failure.failure_type,
            failure.retry_count,
            self.max_retries,
        ) {
            RecoveryStrategyKind::Retry => Strategy::Retry(RetryStrategy {
                max_retries: self.max_retries,
            }),
            RecoveryStrategyKind::Skip => Strategy::Skip(SkipStrategy),
            RecoveryStrategyKind::Rollback => Strategy::Rollback(RollbackStrategy {
                max_retries: self.max_retries,
                working_tree: &self.working_tree,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedWorkingTree;

    const TEST_FAILURE: &str = "running 3 tests\ntest parse ... FAILED\ntest result: FAILED. 1 failed";
    const COMPILE_FAILURE: &str = "error[E0425]: cannot find value `x` in this scope";
    const AGENT_ERROR: &str = "fatal: connection reset";

    fn manager(
        strategy: RecoveryStrategyKind,
        max_retries: u32,
        tree: &ScriptedWorkingTree,
    ) -> RecoveryManager<&ScriptedWorkingTree> {
        RecoveryManager::new(strategy, max_retries, tree)
    }

    #[test]
    fn clean_output_is_success() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Retry, 3, &tree);
        let (failure, result) = recovery.handle_failure("all good", 0, 1, 1);
        assert!(failure.is_none());
        assert!(result.success);
        assert!(!result.should_retry && !result.should_skip);
        assert_eq!(recovery.tracker().total_failures(), 0);
    }

    #[test]
    fn retry_then_skip_when_exhausted() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Retry, 3, &tree);

        for attempt in 1..=2 {
            let (failure, result) = recovery.handle_failure(TEST_FAILURE, 1, 5, attempt);
            let failure = failure.expect("failure");
            assert_eq!(failure.failure_type, FailureType::TestFailure);
            assert_eq!(failure.retry_count, attempt);
            assert!(result.should_retry);
            let guidance = result.modified_prompt.expect("guidance");
            assert!(guidance.contains("Fix the failing tests first"));
        }

        let (_, result) = recovery.handle_failure(TEST_FAILURE, 1, 5, 3);
        assert!(result.should_skip);
        assert!(!result.should_retry);
        assert!(result.message.contains("after 3 failure(s)"));
    }

    #[test]
    fn failure_past_max_retries_skips_under_every_strategy() {
        let max_retries = 2;
        for strategy in [
            RecoveryStrategyKind::Retry,
            RecoveryStrategyKind::Skip,
            RecoveryStrategyKind::Rollback,
        ] {
            let tree = ScriptedWorkingTree::dirty();
            let mut recovery = manager(strategy, max_retries, &tree);
            let mut last = RecoveryResult::default();
            for iteration in 1..=max_retries + 1 {
                last = recovery.handle_failure(TEST_FAILURE, 1, 9, iteration).1;
                let tracker = recovery.tracker();
                assert_eq!(tracker.retry_count(9) as usize, tracker.failures(9).len());
            }
            assert!(last.should_skip, "strategy {strategy} should skip");
        }
    }

    #[test]
    fn zero_max_retries_skips_first_failure() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Retry, 0, &tree);
        let (_, result) = recovery.handle_failure(AGENT_ERROR, 1, 1, 1);
        assert!(result.should_skip);
    }

    #[test]
    fn rollback_default_only_rolls_back_code_failures() {
        assert_eq!(
            select_strategy(RecoveryStrategyKind::Rollback, FailureType::TypecheckFailure, 1, 3),
            RecoveryStrategyKind::Rollback
        );
        assert_eq!(
            select_strategy(RecoveryStrategyKind::Rollback, FailureType::Timeout, 1, 3),
            RecoveryStrategyKind::Retry
        );
        assert_eq!(
            select_strategy(RecoveryStrategyKind::Retry, FailureType::TestFailure, 3, 3),
            RecoveryStrategyKind::Skip
        );
        assert_eq!(
            select_strategy(RecoveryStrategyKind::Skip, FailureType::AgentError, 0, 3),
            RecoveryStrategyKind::Skip
        );
    }

    #[test]
    fn rollback_discards_changes_and_retries() {
        let tree = ScriptedWorkingTree::dirty();
        let mut recovery = manager(RecoveryStrategyKind::Rollback, 3, &tree);
        let (_, result) = recovery.handle_failure(COMPILE_FAILURE, 1, 2, 1);
        assert!(result.should_retry);
        assert_eq!(tree.discards(), 1);
        assert!(!tree.is_dirty());
        let guidance = result.modified_prompt.expect("guidance");
        assert!(guidance.contains("Changes rolled back"));
        assert!(guidance.contains("Fix compilation first"));
    }

    #[test]
    fn rollback_with_clean_tree_is_a_plain_retry() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Rollback, 3, &tree);
        let (_, result) = recovery.handle_failure(COMPILE_FAILURE, 1, 2, 1);
        assert!(result.should_retry);
        assert_eq!(tree.discards(), 0);
        assert!(!result.modified_prompt.expect("guidance").contains("rolled back"));
    }

    #[test]
    fn rollback_outside_work_tree_skips() {
        let tree = ScriptedWorkingTree::not_a_repo();
        let mut recovery = manager(RecoveryStrategyKind::Rollback, 3, &tree);
        let (_, result) = recovery.handle_failure(TEST_FAILURE, 1, 4, 1);
        assert!(result.should_skip);
        assert!(!result.success);
        assert!(result.message.contains("not a git work tree"));
    }

    #[test]
    fn failed_discard_degrades_to_skip() {
        let tree = ScriptedWorkingTree::failing_discard();
        let mut recovery = manager(RecoveryStrategyKind::Rollback, 3, &tree);
        let (_, result) = recovery.handle_failure(TEST_FAILURE, 1, 4, 1);
        assert!(result.should_skip);
        assert!(result.message.contains("discarding changes failed"));
    }

    #[test]
    fn units_are_tracked_independently() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Retry, 3, &tree);
        recovery.handle_failure(TEST_FAILURE, 1, 1, 1);
        recovery.handle_failure(TEST_FAILURE, 1, 1, 2);
        recovery.handle_failure(AGENT_ERROR, 1, 2, 3);

        assert_eq!(recovery.tracker().retry_count(1), 2);
        assert_eq!(recovery.tracker().retry_count(2), 1);

        assert_eq!(recovery.record_success(1), 2);
        assert_eq!(recovery.tracker().retry_count(1), 0);
        assert_eq!(recovery.tracker().retry_count(2), 1);

        recovery.reset_unit(2);
        assert_eq!(recovery.tracker().total_failures(), 0);
    }

    #[test]
    fn loop_detected_agent_error_goes_through_the_same_retry_budget() {
        let tree = ScriptedWorkingTree::clean();
        let mut recovery = manager(RecoveryStrategyKind::Retry, 2, &tree);
        recovery.handle_failure(TEST_FAILURE, 1, 4, 1);

        let (failure, result) =
            recovery.handle_agent_error("plan no longer valid".to_string(), "", 4, 2);
        assert_eq!(failure.failure_type, FailureType::AgentError);
        assert_eq!(failure.retry_count, 2);
        assert_eq!(failure.message, "plan no longer valid");
        assert!(result.should_skip);
    }
}
