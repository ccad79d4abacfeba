//! Plan-level replanning: trigger detection, numbered backups, and the
//! incremental / agent / no-op restructuring strategies.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{
    IncrementalInput, Plan, PlanDiff, PlanUnit, diff_plans, extract_json_array, find_unit,
    incremental_replan, requirements_fingerprint,
};
use crate::core::types::{FailureType, ReplanStrategy, ReplanTrigger, UnitId};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::paths::LoopPaths;
use crate::io::plan_store::{
    PlanVersion, create_backup, list_versions, load_plan, parse_plan_str, restore_backup,
    write_plan,
};
use crate::io::prompt::{PromptEngine, ReplanPrompt};

/// Replan policy and agent limits.
#[derive(Debug, Clone)]
pub struct ReplanSettings {
    pub auto_replan: bool,
    /// Consecutive failures that trigger a `test_failure` replan.
    pub threshold: u32,
    pub agent_timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What the replan manager has observed so far in this run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplanState {
    pub current_unit: Option<UnitId>,
    pub consecutive_failures: u32,
    /// Failure types seen since the last success or replan, in first-seen order.
    pub failure_types: Vec<FailureType>,
    pub blocked: BTreeSet<UnitId>,
    pub total_iterations: u32,
    pub last_trigger_at: Option<DateTime<Utc>>,
    /// Blocked set as of the last replan; only growth beyond it triggers.
    blocked_at_last_replan: BTreeSet<UnitId>,
    requirements_changed: bool,
    fingerprint: Option<String>,
}

impl ReplanState {
    pub fn requirements_changed(&self) -> bool {
        self.requirements_changed
    }
}

/// Outcome of one replan.
#[derive(Debug, Clone)]
pub struct ReplanResult {
    pub success: bool,
    pub message: String,
    /// Backup of the plan as it was before this replan.
    pub backup_path: Option<PathBuf>,
    pub new_plan: Option<Plan>,
    pub diff: PlanDiff,
}

pub struct ReplanManager<'a, A: AgentRunner> {
    paths: LoopPaths,
    agent: &'a A,
    settings: ReplanSettings,
    state: ReplanState,
    prompts: PromptEngine,
}

impl<'a, A: AgentRunner> ReplanManager<'a, A> {
    pub fn new(paths: &LoopPaths, agent: &'a A, settings: ReplanSettings) -> Result<Self> {
        if settings.threshold == 0 {
            return Err(anyhow!("replan threshold must be > 0"));
        }
        Ok(Self {
            paths: paths.clone(),
            agent,
            settings,
            state: ReplanState::default(),
            prompts: PromptEngine::new()?,
        })
    }

    pub fn state(&self) -> &ReplanState {
        &self.state
    }

    /// Refresh state after an iteration.
    ///
    /// Blocked ids that left the plan or were completed are pruned. A change
    /// in the plan's requirements since the last observation (or since our
    /// own last write) is remembered as a pending `requirement_change`.
    pub fn update_state(
        &mut self,
        current_unit: Option<UnitId>,
        consecutive_failures: u32,
        failure_types: &[FailureType],
        current_plan: &[PlanUnit],
    ) {
        self.state.current_unit = current_unit;
        self.state.consecutive_failures = consecutive_failures;
        for failure_type in failure_types {
            if !self.state.failure_types.contains(failure_type) {
                self.state.failure_types.push(*failure_type);
            }
        }
        self.state.total_iterations += 1;

        let still_open =
            |id: &UnitId| find_unit(current_plan, *id).is_some_and(|unit| !unit.tested);
        self.state.blocked.retain(still_open);
        self.state.blocked_at_last_replan.retain(still_open);

        let fingerprint = requirements_fingerprint(current_plan);
        match &self.state.fingerprint {
            Some(previous) if *previous != fingerprint => {
                info!("plan requirements changed");
                self.state.requirements_changed = true;
            }
            _ => {}
        }
        self.state.fingerprint = Some(fingerprint);
    }

    pub fn add_blocked_feature(&mut self, id: UnitId) {
        if self.state.blocked.insert(id) {
            debug!(unit_id = id, "unit blocked");
        }
    }

    /// Forget the failure streak after a successful iteration.
    pub fn reset_state(&mut self) {
        self.state.consecutive_failures = 0;
        self.state.failure_types.clear();
    }

    /// Record a plan the loop itself wrote so it is not mistaken for an
    /// external requirement change.
    pub fn acknowledge_plan_write(&mut self, plan: &[PlanUnit]) {
        self.state.fingerprint = Some(requirements_fingerprint(plan));
    }

    /// Decide whether to replan now. Never fires with auto-replan off.
    pub fn should_replan(&self) -> Option<ReplanTrigger> {
        if !self.settings.auto_replan {
            return None;
        }
        if self.state.consecutive_failures >= self.settings.threshold {
            return Some(ReplanTrigger::TestFailure);
        }
        if self
            .state
            .blocked
            .iter()
            .any(|id| !self.state.blocked_at_last_replan.contains(id))
        {
            return Some(ReplanTrigger::BlockedFeature);
        }
        if self.state.requirements_changed {
            return Some(ReplanTrigger::RequirementChange);
        }
        None
    }

    /// Back up the plan, restructure it with `strategy`, and write the result
    /// if anything changed.
    ///
    /// Only failing to take the backup is an error. A strategy that fails is
    /// reported through an unsuccessful [`ReplanResult`] that still carries
    /// the backup path.
    #[instrument(skip_all, fields(strategy = %strategy, trigger = %trigger))]
    pub fn execute_replan(
        &mut self,
        strategy: ReplanStrategy,
        trigger: ReplanTrigger,
    ) -> Result<ReplanResult> {
        let backup = create_backup(&self.paths.plan_path, trigger.as_str())
            .context("back up plan before replanning")?;

        let outcome = load_plan(&self.paths.plan_path).and_then(|old| {
            let new = self.restructure(strategy, trigger, &old, backup.version)?;
            Ok((old, new))
        });

        self.state.consecutive_failures = 0;
        self.state.failure_types.clear();
        self.state.last_trigger_at = Some(Utc::now());
        self.state.blocked_at_last_replan = self.state.blocked.clone();
        self.state.requirements_changed = false;

        let (old, new) = match outcome {
            Ok(plans) => plans,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "replan strategy failed");
                return Ok(ReplanResult {
                    success: false,
                    message: format!("{strategy} replan failed: {err:#}"),
                    backup_path: Some(backup.path),
                    new_plan: None,
                    diff: PlanDiff::default(),
                });
            }
        };

        let diff = diff_plans(&old, &new);
        if !diff.is_empty() {
            write_plan(&self.paths.plan_path, &new)?;
        }
        // Reshaped units are no longer blocked.
        for id in diff.touched() {
            self.state.blocked.remove(&id);
            self.state.blocked_at_last_replan.remove(&id);
        }
        self.acknowledge_plan_write(&new);

        info!(version = backup.version, diff = %diff.summary(), "replan finished");
        Ok(ReplanResult {
            success: true,
            message: format!("{strategy} replan after {trigger}: {}", diff.summary()),
            backup_path: Some(backup.path),
            new_plan: Some(new),
            diff,
        })
    }

    /// Replan on request, regardless of triggers or the auto-replan flag.
    pub fn manual_replan(&mut self, strategy: ReplanStrategy) -> Result<ReplanResult> {
        self.execute_replan(strategy, ReplanTrigger::Manual)
    }

    pub fn versions(&self) -> Result<Vec<PlanVersion>> {
        list_versions(&self.paths.plan_path)
    }

    /// Restore backup `version` over the live plan (backing the live plan up
    /// first). The restored content becomes the new requirements baseline.
    pub fn restore_version(&mut self, version: u32) -> Result<Option<PlanVersion>> {
        let safety = restore_backup(&self.paths.plan_path, version)?;
        match load_plan(&self.paths.plan_path) {
            Ok(plan) => self.acknowledge_plan_write(&plan),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "restored plan does not validate");
                self.state.fingerprint = None;
            }
        }
        Ok(safety)
    }

    fn restructure(
        &self,
        strategy: ReplanStrategy,
        trigger: ReplanTrigger,
        old: &Plan,
        version: u32,
    ) -> Result<Plan> {
        match strategy {
            ReplanStrategy::None => Ok(old.clone()),
            ReplanStrategy::Incremental if trigger == ReplanTrigger::RequirementChange => {
                Ok(old.clone())
            }
            ReplanStrategy::Incremental => Ok(incremental_replan(
                old,
                &IncrementalInput {
                    current_unit: self.state.current_unit,
                    split_current: trigger == ReplanTrigger::TestFailure,
                    blocked: self.state.blocked.clone(),
                },
            )),
            ReplanStrategy::Agent => self.agent_replan(old, trigger, version),
        }
    }

    fn agent_replan(&self, old: &Plan, trigger: ReplanTrigger, version: u32) -> Result<Plan> {
        let blocked: Vec<UnitId> = self.state.blocked.iter().copied().collect();
        let prompt = self.prompts.render_replan(&ReplanPrompt {
            plan: old,
            trigger,
            current_unit: self.state.current_unit,
            consecutive_failures: self.state.consecutive_failures,
            failure_types: &self.state.failure_types,
            blocked: &blocked,
        })?;

        let outcome = self.agent.run(&AgentRequest {
            workdir: self.paths.root.clone(),
            prompt,
            timeout: self.settings.agent_timeout,
            output_limit_bytes: self.settings.output_limit_bytes,
            log_path: Some(self.paths.replan_log_path(version)),
        })?;
        if outcome.exit_code != 0 {
            return Err(anyhow!(
                "replan agent exited with code {}",
                outcome.exit_code
            ));
        }

        let json = extract_json_array(&outcome.output)
            .ok_or_else(|| anyhow!("replan agent output contained no JSON array"))?;
        let new = parse_plan_str(json).context("validate replanned plan")?;

        for done in old.iter().filter(|unit| unit.tested) {
            if find_unit(&new, done.id) != Some(done) {
                return Err(anyhow!(
                    "replanned plan dropped or changed tested unit #{}",
                    done.id
                ));
            }
        }
        Ok(new)
    }
}
