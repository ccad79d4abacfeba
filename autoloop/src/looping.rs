//! The driving loop for `autoloop run`.
//!
//! One iteration = pick the next open unit, check its budget, run the agent,
//! recover from any failure, then ask the replan manager whether the plan
//! itself needs restructuring. The loop stops when no open unit is left, the
//! run deadline passes, or the global iteration limit is reached.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::iteration_budget;
use crate::core::guidance::simplification_hint;
use crate::core::plan::{Plan, find_unit, mark_deferred};
use crate::core::scope::{Constraints, ScopeManager, ScopeStatus};
use crate::core::selector::next_open_unit;
use crate::core::types::{
    DeferReason, FailureType, RecoveryStrategyKind, ReplanStrategy, ReplanTrigger, UnitId,
};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::LoopConfig;
use crate::io::git::WorkingTree;
use crate::io::paths::LoopPaths;
use crate::io::plan_store::{INVALID_PLAN_CAUSE, create_backup, load_plan, write_plan};
use crate::io::progress_log::ProgressLog;
use crate::io::prompt::{IterationPrompt, PromptEngine};
use crate::recovery::RecoveryManager;
use crate::replan::{ReplanManager, ReplanSettings};

/// Effective settings for one run (config plus CLI overrides, deadline resolved).
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_retries: u32,
    pub recovery_strategy: RecoveryStrategyKind,
    pub constraints: Constraints,
    pub auto_replan: bool,
    pub replan_strategy: ReplanStrategy,
    pub replan_threshold: u32,
    /// 0 means unlimited.
    pub max_iterations: u32,
    pub iteration_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl LoopSettings {
    /// Resolve the relative deadline in `config` against `started_at`.
    pub fn from_config(config: &LoopConfig, started_at: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let deadline = match config.deadline_duration()? {
            Some(duration) => Some(
                TimeDelta::from_std(duration)
                    .ok()
                    .and_then(|delta| started_at.checked_add_signed(delta))
                    .ok_or_else(|| anyhow!("deadline '{}' out of range", config.deadline))?,
            ),
            None => None,
        };
        Ok(Self {
            max_retries: config.max_retries,
            recovery_strategy: config.recovery_strategy,
            constraints: Constraints {
                max_iterations_per_feature: config.scope_limit,
                deadline,
                auto_defer: config.auto_defer,
            },
            auto_replan: config.auto_replan,
            replan_strategy: config.replan_strategy,
            replan_threshold: config.replan_threshold,
            max_iterations: config.max_iterations,
            iteration_timeout: config.iteration_timeout(),
            output_limit_bytes: config.agent_output_limit_bytes,
        })
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStop {
    /// No open unit is left (everything tested, deferred, or skipped).
    Complete,
    Deadline,
    MaxIterations,
}

impl LoopStop {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStop::Complete => "complete",
            LoopStop::Deadline => "deadline",
            LoopStop::MaxIterations => "max_iterations",
        }
    }
}

/// What happened to the unit in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationAction {
    /// The agent marked the unit tested.
    Completed,
    /// No failure, but the unit is not done yet.
    Progressed,
    Retry,
    Skipped,
}

impl IterationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationAction::Completed => "completed",
            IterationAction::Progressed => "progressed",
            IterationAction::Retry => "retry",
            IterationAction::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplanReport {
    pub trigger: ReplanTrigger,
    pub success: bool,
    pub message: String,
    pub backup_path: Option<PathBuf>,
}

/// Per-iteration callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub unit_id: UnitId,
    pub failure: Option<FailureType>,
    pub retry_count: u32,
    pub action: IterationAction,
    pub message: String,
    pub replan: Option<ReplanReport>,
}

/// End-of-run totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations: u32,
    pub completed: Vec<UnitId>,
    /// Units that failed at least once and were not completed.
    pub failed: Vec<UnitId>,
    pub skipped: Vec<UnitId>,
    /// Units deferred during this run, by the loop or by a replan.
    pub deferred: Vec<UnitId>,
    /// Failures on units that later succeeded.
    pub recovered: u32,
    pub total_failures: u32,
    pub replans: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub summary: RunSummary,
    pub scope: ScopeStatus,
}

impl LoopOutcome {
    /// True when the run finished with nothing skipped.
    pub fn is_clean(&self) -> bool {
        self.stop == LoopStop::Complete && self.summary.skipped.is_empty()
    }
}

/// Run iterations until the plan is exhausted, the deadline passes, or the
/// iteration limit is hit.
///
/// Errors are reserved for problems the loop cannot route around: an
/// unreadable or invalid plan, an agent that cannot be started, or a failing
/// write of the plan, progress log, or backups.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn run_loop<A, W, F>(
    paths: &LoopPaths,
    settings: &LoopSettings,
    agent: &A,
    working_tree: W,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    A: AgentRunner,
    W: WorkingTree,
    F: FnMut(&IterationReport),
{
    let progress = ProgressLog::new(&paths.progress_path);
    let prompts = PromptEngine::new()?;
    let mut scope = ScopeManager::new(settings.constraints.clone());
    let mut recovery =
        RecoveryManager::new(settings.recovery_strategy, settings.max_retries, working_tree);
    let mut replan = ReplanManager::new(
        paths,
        agent,
        ReplanSettings {
            auto_replan: settings.auto_replan,
            threshold: settings.replan_threshold,
            agent_timeout: settings.iteration_timeout,
            output_limit_bytes: settings.output_limit_bytes,
        },
    )?;

    let initial_plan = load_plan(&paths.plan_path)?;
    let initially_deferred: BTreeSet<UnitId> = initial_plan
        .iter()
        .filter(|unit| unit.deferred)
        .map(|unit| unit.id)
        .collect();
    replan.acknowledge_plan_write(&initial_plan);
    let mut last_valid = initial_plan;

    let mut skipped: BTreeSet<UnitId> = BTreeSet::new();
    let mut failed: BTreeSet<UnitId> = BTreeSet::new();
    let mut guidance: BTreeMap<UnitId, String> = BTreeMap::new();
    let mut summary = RunSummary::default();
    let mut consecutive_failures = 0u32;
    let mut iteration = 0u32;

    let stop = loop {
        if scope.deadline_passed() {
            if settings.constraints.auto_defer {
                let mut plan = load_valid_plan(paths, &mut last_valid)?;
                if let Some(id) = next_open_unit(&plan, &skipped).map(|unit| unit.id) {
                    defer_unit(&mut plan, id, DeferReason::Deadline, paths, &progress)?;
                    scope.defer_feature(id, DeferReason::Deadline);
                    replan.acknowledge_plan_write(&plan);
                }
            }
            info!("run deadline passed");
            break LoopStop::Deadline;
        }
        if settings.max_iterations > 0 && iteration >= settings.max_iterations {
            info!(max_iterations = settings.max_iterations, "iteration limit reached");
            break LoopStop::MaxIterations;
        }

        let mut plan = load_valid_plan(paths, &mut last_valid)?;
        let Some(unit) = next_open_unit(&plan, &skipped).cloned() else {
            break LoopStop::Complete;
        };

        scope.start_feature(unit.id, unit.steps.len(), &unit.description);
        if let Some(reason) = scope.should_defer(unit.id) {
            if settings.constraints.auto_defer {
                defer_unit(&mut plan, unit.id, reason, paths, &progress)?;
                scope.defer_feature(unit.id, reason);
                replan.acknowledge_plan_write(&plan);
                continue;
            }
            warn!(unit_id = unit.id, %reason, "unit over budget, auto-defer disabled");
        }

        let Ok(timeout) =
            iteration_budget(settings.iteration_timeout, settings.constraints.deadline, Utc::now())
        else {
            continue;
        };

        iteration += 1;
        scope.record_iteration(unit.id);
        let simplify = scope
            .should_suggest_simplification(unit.id)
            .then(simplification_hint);
        let prompt = prompts.render_iteration(&IterationPrompt {
            unit: &unit,
            plan_path: &paths.plan_path,
            progress_path: &paths.progress_path,
            guidance: guidance.get(&unit.id).map(String::as_str),
            simplify,
        })?;

        debug!(iteration, unit_id = unit.id, "running agent");
        let outcome = agent
            .run(&AgentRequest {
                workdir: paths.root.clone(),
                prompt,
                timeout,
                output_limit_bytes: settings.output_limit_bytes,
                log_path: Some(paths.agent_log_path(iteration)),
            })
            .with_context(|| format!("iteration {iteration}: run agent for unit #{}", unit.id))?;

        let (failure, result) = match load_plan(&paths.plan_path) {
            Ok(_) => recovery.handle_failure(&outcome.output, outcome.exit_code, unit.id, iteration),
            Err(err) => {
                restore_valid_plan(paths, &last_valid, &err)?;
                let (failure, result) = recovery.handle_agent_error(
                    format!("agent left an invalid plan: {err:#}"),
                    &outcome.output,
                    unit.id,
                    iteration,
                );
                (Some(failure), result)
            }
        };
        let plan_after = load_valid_plan(paths, &mut last_valid)
            .with_context(|| format!("iteration {iteration}: reload plan"))?;

        let mut failure_types = Vec::new();
        let (action, retry_count) = match &failure {
            None => {
                consecutive_failures = 0;
                replan.reset_state();
                summary.recovered += recovery.record_success(unit.id);
                guidance.remove(&unit.id);
                if find_unit(&plan_after, unit.id).is_some_and(|after| after.tested) {
                    scope.complete_feature(unit.id);
                    progress.complete(unit.id)?;
                    summary.completed.push(unit.id);
                    (IterationAction::Completed, 0)
                } else {
                    (IterationAction::Progressed, 0)
                }
            }
            Some(failure) => {
                summary.total_failures += 1;
                consecutive_failures += 1;
                failed.insert(unit.id);
                failure_types.push(failure.failure_type);
                progress.failure(failure)?;
                if result.should_skip {
                    skipped.insert(unit.id);
                    guidance.remove(&unit.id);
                    replan.add_blocked_feature(unit.id);
                    progress.skipped(unit.id, recovery.tracker().failures(unit.id).len())?;
                    (IterationAction::Skipped, failure.retry_count)
                } else {
                    if let Some(text) = &result.modified_prompt {
                        guidance.insert(unit.id, text.clone());
                    }
                    (IterationAction::Retry, failure.retry_count)
                }
            }
        };

        replan.update_state(Some(unit.id), consecutive_failures, &failure_types, &plan_after);
        let mut replan_report = None;
        if let Some(trigger) = replan.should_replan() {
            progress.replan(trigger, settings.replan_strategy)?;
            let replanned = replan.execute_replan(settings.replan_strategy, trigger)?;
            summary.replans += 1;
            consecutive_failures = 0;
            if replanned.success {
                for id in replanned.diff.touched() {
                    recovery.reset_unit(id);
                    skipped.remove(&id);
                    guidance.remove(&id);
                }
            } else {
                warn!(message = %replanned.message, "replan did not apply");
            }
            replan_report = Some(ReplanReport {
                trigger,
                success: replanned.success,
                message: replanned.message,
                backup_path: replanned.backup_path,
            });
        }

        on_iteration(&IterationReport {
            iteration,
            unit_id: unit.id,
            failure: failure.as_ref().map(|failure| failure.failure_type),
            retry_count,
            action,
            message: result.message,
            replan: replan_report,
        });
    };

    let final_plan = load_plan(&paths.plan_path)?;
    summary.iterations = iteration;
    summary.skipped = skipped.into_iter().collect();
    summary.deferred = final_plan
        .iter()
        .filter(|unit| unit.deferred && !initially_deferred.contains(&unit.id))
        .map(|unit| unit.id)
        .collect();
    summary.failed = failed
        .into_iter()
        .filter(|id| !summary.completed.contains(id))
        .collect();

    info!(
        stop = stop.as_str(),
        iterations = summary.iterations,
        completed = summary.completed.len(),
        "loop finished"
    );
    Ok(LoopOutcome {
        stop,
        summary,
        scope: scope.status(),
    })
}

/// Load the plan, putting `last_valid` back if the file no longer loads.
/// On success the loaded plan becomes the new `last_valid`.
fn load_valid_plan(paths: &LoopPaths, last_valid: &mut Plan) -> Result<Plan> {
    match load_plan(&paths.plan_path) {
        Ok(plan) => {
            *last_valid = plan.clone();
            Ok(plan)
        }
        Err(err) => {
            restore_valid_plan(paths, last_valid, &err)?;
            Ok(last_valid.clone())
        }
    }
}

fn restore_valid_plan(paths: &LoopPaths, valid: &Plan, err: &anyhow::Error) -> Result<()> {
    warn!(err = %format!("{err:#}"), "plan no longer valid, restoring last valid plan");
    if paths.plan_path.exists() {
        let backup = create_backup(&paths.plan_path, INVALID_PLAN_CAUSE)
            .context("back up invalid plan")?;
        debug!(version = backup.version, "invalid plan backed up");
    }
    write_plan(&paths.plan_path, valid).context("restore last valid plan")
}

fn defer_unit(
    plan: &mut Plan,
    id: UnitId,
    reason: DeferReason,
    paths: &LoopPaths,
    progress: &ProgressLog,
) -> Result<()> {
    if mark_deferred(plan, id, reason) {
        write_plan(&paths.plan_path, plan)?;
        progress.deferred(id, reason)?;
        info!(unit_id = id, %reason, "unit deferred");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::plan_store::list_versions;
    use crate::test_support::{
        PlanEdit, ScriptedAgent, ScriptedRun, ScriptedWorkingTree, TestWorkspace,
        unit_with_steps,
    };
    use std::fs;

    fn settings() -> LoopSettings {
        LoopSettings::from_config(&LoopConfig::default(), Utc::now()).expect("settings")
    }

    #[test]
    fn settings_resolve_deadline_from_start() {
        let started = Utc::now();
        let config = LoopConfig {
            deadline: "1h30m".to_string(),
            scope_limit: 4,
            ..LoopConfig::default()
        };
        let settings = LoopSettings::from_config(&config, started).expect("settings");
        assert_eq!(
            settings.constraints.deadline,
            Some(started + TimeDelta::minutes(90))
        );
        assert_eq!(settings.constraints.max_iterations_per_feature, 4);
    }

    #[test]
    fn deadline_past_datetime_range_is_an_error() {
        let config = LoopConfig {
            deadline: "10000000000h".to_string(),
            ..LoopConfig::default()
        };
        let err = LoopSettings::from_config(&config, Utc::now()).expect_err("out of range");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn completes_units_in_order() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1), unit_with_steps(2, 1)])
            .expect("workspace");
        let agent = ScriptedAgent::new(vec![ScriptedRun::completes(1), ScriptedRun::completes(2)]);
        let tree = ScriptedWorkingTree::clean();

        let mut reports = Vec::new();
        let outcome = run_loop(ws.paths(), &settings(), &agent, &tree, |report| {
            reports.push(report.clone());
        })
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert!(outcome.is_clean());
        assert_eq!(outcome.summary.completed, vec![1, 2]);
        assert_eq!(outcome.summary.iterations, 2);
        assert!(reports.iter().all(|r| r.action == IterationAction::Completed));
        assert!(agent.prompts()[0].contains("### Unit #1"));
        assert_eq!(
            ws.read_progress().expect("progress"),
            "COMPLETE: unit #1\nCOMPLETE: unit #2\n"
        );
    }

    #[test]
    fn retry_guidance_reaches_next_prompt() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1)]).expect("workspace");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::failing(1, "error[E0308]: mismatched types"),
            ScriptedRun::completes(1),
        ]);
        let tree = ScriptedWorkingTree::clean();

        let outcome = run_loop(ws.paths(), &settings(), &agent, &tree, |_| {}).expect("loop");

        let prompts = agent.prompts();
        assert!(!prompts[0].contains("<guidance>"));
        assert!(prompts[1].contains("Fix compilation first"));
        assert_eq!(outcome.summary.recovered, 1);
        assert_eq!(outcome.summary.total_failures, 1);
        assert!(outcome.summary.failed.is_empty());
        let progress = ws.read_progress().expect("progress");
        assert!(progress.starts_with(
            "FAILURE [typecheck_failure]: error[E0308]: mismatched types (unit #1, retry 1)\n"
        ));
    }

    #[test]
    fn iteration_limit_defers_unit() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1), unit_with_steps(2, 1)])
            .expect("workspace");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::ok("made some progress"),
            ScriptedRun::ok("made more progress"),
            ScriptedRun::completes(2),
        ]);
        let tree = ScriptedWorkingTree::clean();
        let mut settings = settings();
        settings.constraints.max_iterations_per_feature = 2;

        let outcome = run_loop(ws.paths(), &settings, &agent, &tree, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.summary.deferred, vec![1]);
        assert_eq!(outcome.summary.completed, vec![2]);
        let plan = ws.read_plan().expect("plan");
        assert_eq!(plan[0].defer_reason, Some(DeferReason::IterationLimit));
        assert!(
            ws.read_progress()
                .expect("progress")
                .contains("DEFERRED: unit #1 (iteration_limit)")
        );
        assert_eq!(outcome.scope.deferred, vec![1]);
    }

    #[test]
    fn passed_deadline_defers_current_unit_and_stops() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1)]).expect("workspace");
        let agent = ScriptedAgent::default();
        let tree = ScriptedWorkingTree::clean();
        let mut settings = settings();
        settings.constraints.deadline = Some(Utc::now() - TimeDelta::seconds(1));

        let outcome = run_loop(ws.paths(), &settings, &agent, &tree, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Deadline);
        assert_eq!(outcome.summary.iterations, 0);
        assert_eq!(outcome.summary.deferred, vec![1]);
        assert_eq!(
            ws.read_plan().expect("plan")[0].defer_reason,
            Some(DeferReason::Deadline)
        );
    }

    #[test]
    fn max_iterations_stops_run() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1)]).expect("workspace");
        let agent = ScriptedAgent::new(vec![ScriptedRun::ok("working"), ScriptedRun::ok("working")]);
        let tree = ScriptedWorkingTree::clean();
        let mut settings = settings();
        settings.max_iterations = 2;

        let outcome = run_loop(ws.paths(), &settings, &agent, &tree, |_| {}).expect("loop");
        assert_eq!(outcome.stop, LoopStop::MaxIterations);
        assert_eq!(outcome.summary.iterations, 2);
        assert!(!outcome.is_clean());
        assert_eq!(agent.remaining(), 0);
    }

    #[test]
    fn skipped_unit_is_not_selected_again() {
        let ws = TestWorkspace::new(&vec![unit_with_steps(1, 1), unit_with_steps(2, 1)])
            .expect("workspace");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun::failing(1, "fatal: agent crashed"),
            ScriptedRun::completes(2),
        ]);
        let tree = ScriptedWorkingTree::clean();
        let mut settings = settings();
        settings.recovery_strategy = RecoveryStrategyKind::Skip;

        let outcome = run_loop(ws.paths(), &settings, &agent, &tree, |_| {}).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.summary.skipped, vec![1]);
        assert_eq!(outcome.summary.failed, vec![1]);
        assert_eq!(outcome.summary.completed, vec![2]);
        assert!(
            ws.read_progress()
                .expect("progress")
                .contains("SKIPPED: unit #1 after 1 failures")
        );
    }

    #[test]
    fn invalid_plan_from_agent_is_restored_and_counted_as_agent_error() {
        let plan = vec![unit_with_steps(1, 1), unit_with_steps(2, 1)];
        let ws = TestWorkspace::new(&plan).expect("workspace");
        let original = fs::read(ws.plan_path()).expect("read plan");
        let agent = ScriptedAgent::new(vec![
            ScriptedRun {
                plan_edit: Some(PlanEdit::Replace(vec![
                    unit_with_steps(1, 1),
                    unit_with_steps(1, 2),
                ])),
                ..ScriptedRun::ok("rewrote the plan")
            },
            ScriptedRun::completes(1),
            ScriptedRun::completes(2),
        ]);

        let mut reports = Vec::new();
        let outcome = run_loop(
            ws.paths(),
            &settings(),
            &agent,
            ScriptedWorkingTree::clean(),
            |report| reports.push(report.clone()),
        )
        .expect("loop");

        assert_eq!(reports[0].unit_id, 1);
        assert_eq!(reports[0].failure, Some(FailureType::AgentError));
        assert_eq!(reports[0].action, IterationAction::Retry);
        assert!(agent.prompts()[1].contains("invalid plan"));

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.summary.completed, vec![1, 2]);
        assert_eq!(outcome.summary.recovered, 1);

        let versions = list_versions(&ws.plan_path()).expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].cause, INVALID_PLAN_CAUSE);
        assert_ne!(fs::read(&versions[0].path).expect("read backup"), original);
        assert!(
            ws.read_progress()
                .expect("progress")
                .contains("FAILURE [agent_error]: agent left an invalid plan")
        );
    }
}
