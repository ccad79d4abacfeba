//! Plan backups and restores across replans.

use std::fs;

use autoloop::core::types::{ReplanStrategy, ReplanTrigger};
use autoloop::io::config::LoopConfig;
use autoloop::io::plan_store::{RESTORE_CAUSE, backup_path, list_versions};
use autoloop::looping::{LoopSettings, run_loop};
use autoloop::replan::{ReplanManager, ReplanSettings};
use autoloop::test_support::{
    PlanEdit, ScriptedAgent, ScriptedRun, ScriptedWorkingTree, TestWorkspace, unit_with_steps,
};
use chrono::Utc;
use std::time::Duration;

fn replan_settings() -> ReplanSettings {
    ReplanSettings {
        auto_replan: true,
        threshold: 3,
        agent_timeout: Duration::from_secs(60),
        output_limit_bytes: 10_000,
    }
}

#[test]
fn every_replan_gets_a_new_version_and_restore_round_trips() {
    let plan = vec![unit_with_steps(1, 6), unit_with_steps(2, 1)];
    let ws = TestWorkspace::new(&plan).expect("workspace");
    let original = fs::read(ws.plan_path()).expect("read plan");
    let agent = ScriptedAgent::default();
    let mut replan = ReplanManager::new(ws.paths(), &agent, replan_settings()).expect("manager");

    replan.update_state(Some(1), 3, &[], &plan);
    let first = replan
        .execute_replan(ReplanStrategy::Incremental, ReplanTrigger::TestFailure)
        .expect("first replan");
    assert!(first.success);
    let after_first = fs::read(ws.plan_path()).expect("read plan");
    assert_ne!(after_first, original);

    let second = replan
        .manual_replan(ReplanStrategy::None)
        .expect("second replan");
    assert!(second.success);

    let versions = replan.versions().expect("versions");
    let numbers: Vec<u32> = versions.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(versions[0].cause, "test_failure");
    assert_eq!(versions[1].cause, "manual");
    assert_eq!(first.backup_path, Some(backup_path(&ws.plan_path(), 1)));

    let safety = replan
        .restore_version(1)
        .expect("restore")
        .expect("safety backup");
    assert_eq!(safety.version, 3);
    assert_eq!(safety.cause, RESTORE_CAUSE);
    assert_eq!(fs::read(ws.plan_path()).expect("read plan"), original);
    assert_eq!(
        fs::read(backup_path(&ws.plan_path(), 3)).expect("read safety"),
        after_first
    );

    // A restored plan is the new baseline, not a requirement change.
    replan.update_state(None, 0, &[], &ws.read_plan().expect("plan"));
    assert!(!replan.state().requirements_changed());
}

#[test]
fn restoring_a_missing_version_fails_without_side_effects() {
    let plan = vec![unit_with_steps(1, 1)];
    let ws = TestWorkspace::new(&plan).expect("workspace");
    let agent = ScriptedAgent::default();
    let mut replan = ReplanManager::new(ws.paths(), &agent, replan_settings()).expect("manager");

    let err = replan.restore_version(9).expect_err("missing version");
    assert!(err.to_string().contains("plan version 9 not found"));
    assert!(list_versions(&ws.plan_path()).expect("versions").is_empty());
}

#[test]
fn loop_replans_when_requirements_change_mid_run() {
    let plan = vec![unit_with_steps(1, 1), unit_with_steps(2, 1)];
    let ws = TestWorkspace::new(&plan).expect("workspace");

    let mut edited = plan.clone();
    edited[0].tested = true;
    edited[1].description = "unit 2, now with pagination".to_string();
    let agent = ScriptedAgent::new(vec![
        ScriptedRun {
            plan_edit: Some(PlanEdit::Replace(edited)),
            ..ScriptedRun::ok("done, and refined unit 2")
        },
        ScriptedRun::completes(2),
    ]);
    let config = LoopConfig {
        auto_replan: true,
        ..LoopConfig::default()
    };
    let settings = LoopSettings::from_config(&config, Utc::now()).expect("settings");

    let mut triggers = Vec::new();
    let outcome = run_loop(
        ws.paths(),
        &settings,
        &agent,
        ScriptedWorkingTree::clean(),
        |report| {
            if let Some(replan) = &report.replan {
                triggers.push(replan.trigger);
            }
        },
    )
    .expect("run loop");

    assert_eq!(triggers, vec![ReplanTrigger::RequirementChange]);
    assert_eq!(outcome.summary.replans, 1);
    assert_eq!(outcome.summary.completed, vec![1, 2]);

    let versions = list_versions(&ws.plan_path()).expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].cause, "requirement_change");
}
