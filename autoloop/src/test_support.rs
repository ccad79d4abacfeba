//! Test-only helpers: plan builders, scripted agents, and scripted working trees.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::plan::{Plan, PlanUnit};
use crate::core::types::UnitId;
use crate::io::agent::{AgentOutcome, AgentRequest, AgentRunner};
use crate::io::config::{LoopConfig, write_config};
use crate::io::git::WorkingTree;
use crate::io::paths::{InitOptions, LoopPaths, init_project};
use crate::io::plan_store::{load_plan, write_plan};

/// Deterministic unit with `step_count` steps named `step 1..=n`.
pub fn unit_with_steps(id: UnitId, step_count: usize) -> PlanUnit {
    let steps = (1..=step_count).map(|i| format!("step {i}")).collect();
    PlanUnit::new(id, format!("unit {id}"), steps)
}

/// Side effect a scripted agent run has on the plan file.
#[derive(Debug, Clone)]
pub enum PlanEdit {
    MarkTested(UnitId),
    Replace(Plan),
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit_code: i32,
    pub output: String,
    pub plan_edit: Option<PlanEdit>,
}

impl ScriptedRun {
    pub fn ok(output: &str) -> Self {
        Self {
            exit_code: 0,
            output: output.to_string(),
            plan_edit: None,
        }
    }

    pub fn failing(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            output: output.to_string(),
            plan_edit: None,
        }
    }

    /// Successful run that marks `id` tested in the plan.
    pub fn completes(id: UnitId) -> Self {
        Self {
            plan_edit: Some(PlanEdit::MarkTested(id)),
            ..Self::ok("all steps done")
        }
    }
}

/// Agent that replays queued runs and records every prompt it was given.
///
/// Plan edits are applied to `plan.json` under the request's working
/// directory.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    runs: RefCell<VecDeque<ScriptedRun>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.runs.borrow().len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no runs left"))?;

        let plan_path = request.workdir.join("plan.json");
        match run.plan_edit {
            Some(PlanEdit::MarkTested(id)) => {
                let mut plan = load_plan(&plan_path)?;
                let unit = plan
                    .iter_mut()
                    .find(|unit| unit.id == id)
                    .ok_or_else(|| anyhow!("scripted agent: unit {id} not in plan"))?;
                unit.tested = true;
                write_plan(&plan_path, &plan)?;
            }
            Some(PlanEdit::Replace(plan)) => write_plan(&plan_path, &plan)?,
            None => {}
        }

        Ok(AgentOutcome {
            exit_code: run.exit_code,
            output: run.output,
            timed_out: false,
        })
    }
}

/// In-memory stand-in for a git working tree.
#[derive(Debug)]
pub struct ScriptedWorkingTree {
    work_tree: bool,
    dirty: Cell<bool>,
    discard_fails: bool,
    discards: Cell<u32>,
}

impl ScriptedWorkingTree {
    pub fn clean() -> Self {
        Self {
            work_tree: true,
            dirty: Cell::new(false),
            discard_fails: false,
            discards: Cell::new(0),
        }
    }

    pub fn dirty() -> Self {
        Self {
            dirty: Cell::new(true),
            ..Self::clean()
        }
    }

    pub fn not_a_repo() -> Self {
        Self {
            work_tree: false,
            ..Self::dirty()
        }
    }

    pub fn failing_discard() -> Self {
        Self {
            discard_fails: true,
            ..Self::dirty()
        }
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.set(dirty);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn discards(&self) -> u32 {
        self.discards.get()
    }
}

impl WorkingTree for ScriptedWorkingTree {
    fn is_work_tree(&self) -> Result<bool> {
        Ok(self.work_tree)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(self.dirty.get())
    }

    fn discard_tracked_changes(&self) -> Result<()> {
        if self.discard_fails {
            return Err(anyhow!("scripted discard failure"));
        }
        self.discards.set(self.discards.get() + 1);
        self.dirty.set(false);
        Ok(())
    }
}

/// Temporary project with `.autoloop/` initialized and a plan in place.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
    paths: LoopPaths,
}

impl TestWorkspace {
    pub fn new(plan: &Plan) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_project(temp.path(), &InitOptions { force: false })?;
        write_plan(&paths.plan_path, plan)?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &LoopPaths {
        &self.paths
    }

    pub fn plan_path(&self) -> PathBuf {
        self.paths.plan_path.clone()
    }

    pub fn read_plan(&self) -> Result<Plan> {
        load_plan(&self.paths.plan_path)
    }

    pub fn write_plan(&self, plan: &Plan) -> Result<()> {
        write_plan(&self.paths.plan_path, plan)
    }

    pub fn read_progress(&self) -> Result<String> {
        if !self.paths.progress_path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&self.paths.progress_path)?)
    }

    pub fn write_config(&self, config: &LoopConfig) -> Result<()> {
        write_config(&self.paths.config_path, config)
    }
}
