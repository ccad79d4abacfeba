//! Prompt rendering for agent invocations.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::{Plan, PlanUnit};
use crate::core::types::{FailureType, ReplanTrigger, UnitId};

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");

#[derive(Debug, Clone, Serialize)]
struct UnitContext<'a> {
    id: UnitId,
    description: &'a str,
    steps: &'a [String],
}

impl<'a> UnitContext<'a> {
    fn from_unit(unit: &'a PlanUnit) -> Self {
        Self {
            id: unit.id,
            description: unit.description.trim(),
            steps: &unit.steps,
        }
    }
}

/// Inputs for one work iteration.
#[derive(Debug, Clone)]
pub struct IterationPrompt<'a> {
    pub unit: &'a PlanUnit,
    pub plan_path: &'a Path,
    pub progress_path: &'a Path,
    /// Recovery guidance carried over from the unit's last failure.
    pub guidance: Option<&'a str>,
    /// One-time hint to simplify the approach.
    pub simplify: Option<&'a str>,
}

/// Inputs for the agent replan strategy.
#[derive(Debug, Clone)]
pub struct ReplanPrompt<'a> {
    pub plan: &'a Plan,
    pub trigger: ReplanTrigger,
    pub current_unit: Option<UnitId>,
    pub consecutive_failures: u32,
    pub failure_types: &'a [FailureType],
    pub blocked: &'a [UnitId],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .context("load iteration template")?;
        env.add_template("replan", REPLAN_TEMPLATE)
            .context("load replan template")?;
        Ok(Self { env })
    }

    pub fn render_iteration(&self, input: &IterationPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("iteration")?;
        let rendered = template
            .render(context! {
                unit => UnitContext::from_unit(input.unit),
                plan_path => input.plan_path.display().to_string(),
                progress_path => input.progress_path.display().to_string(),
                guidance => input.guidance.map(str::trim).filter(|s| !s.is_empty()),
                simplify => input.simplify.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render iteration prompt")?;
        debug!(unit_id = input.unit.id, bytes = rendered.len(), "rendered iteration prompt");
        Ok(rendered)
    }

    pub fn render_replan(&self, input: &ReplanPrompt<'_>) -> Result<String> {
        let plan_json = serde_json::to_string_pretty(input.plan).context("serialize plan")?;
        let failure_types: Vec<&str> = input.failure_types.iter().map(|t| t.as_str()).collect();
        let template = self.env.get_template("replan")?;
        let rendered = template
            .render(context! {
                trigger => input.trigger.as_str(),
                current_unit => input.current_unit,
                consecutive_failures => input.consecutive_failures,
                failure_types => failure_types,
                blocked => input.blocked,
                plan_json => plan_json,
            })
            .context("render replan prompt")?;
        debug!(bytes = rendered.len(), "rendered replan prompt");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unit_with_steps;

    #[test]
    fn iteration_prompt_lists_unit_and_steps_in_order() {
        let unit = unit_with_steps(5, 2);
        let prompt = PromptEngine::new()
            .expect("engine")
            .render_iteration(&IterationPrompt {
                unit: &unit,
                plan_path: Path::new("plan.json"),
                progress_path: Path::new("progress.txt"),
                guidance: None,
                simplify: None,
            })
            .expect("render");

        let contract = prompt.find("<contract>").expect("contract");
        let header = prompt.find("### Unit #5").expect("unit header");
        let first = prompt.find("1. step 1").expect("first step");
        let second = prompt.find("2. step 2").expect("second step");
        assert!(contract < header && header < first && first < second);
        assert!(prompt.contains("`plan.json`"));
        assert!(!prompt.contains("<guidance>"));
        assert!(!prompt.contains("<simplify>"));
    }

    #[test]
    fn iteration_prompt_includes_guidance_and_hint() {
        let unit = unit_with_steps(1, 1);
        let prompt = PromptEngine::new()
            .expect("engine")
            .render_iteration(&IterationPrompt {
                unit: &unit,
                plan_path: Path::new("plan.json"),
                progress_path: Path::new("progress.txt"),
                guidance: Some("## Recovery guidance\nFix the failing tests first"),
                simplify: Some("Try a smaller step."),
            })
            .expect("render");

        let guidance = prompt.find("<guidance>").expect("guidance");
        let simplify = prompt.find("<simplify>").expect("simplify");
        assert!(guidance < simplify);
        assert!(prompt.contains("Fix the failing tests first"));
    }

    #[test]
    fn replan_prompt_embeds_plan_and_trigger() {
        let plan = vec![unit_with_steps(1, 1), unit_with_steps(2, 3)];
        let prompt = PromptEngine::new()
            .expect("engine")
            .render_replan(&ReplanPrompt {
                plan: &plan,
                trigger: ReplanTrigger::BlockedFeature,
                current_unit: Some(2),
                consecutive_failures: 3,
                failure_types: &[FailureType::TestFailure, FailureType::Timeout],
                blocked: &[2],
            })
            .expect("render");

        assert!(prompt.contains("Replanning because of: blocked_feature"));
        assert!(prompt.contains("Unit in progress: #2"));
        assert!(prompt.contains("Failure types seen: test_failure, timeout"));
        assert!(prompt.contains("Blocked units: #2"));
        assert!(prompt.contains("\"id\": 2"));
    }

    #[test]
    fn replan_prompt_omits_empty_context() {
        let plan = vec![unit_with_steps(1, 1)];
        let prompt = PromptEngine::new()
            .expect("engine")
            .render_replan(&ReplanPrompt {
                plan: &plan,
                trigger: ReplanTrigger::Manual,
                current_unit: None,
                consecutive_failures: 0,
                failure_types: &[],
                blocked: &[],
            })
            .expect("render");

        assert!(prompt.contains("Replanning because of: manual"));
        assert!(!prompt.contains("Unit in progress"));
        assert!(!prompt.contains("Blocked units"));
    }
}
