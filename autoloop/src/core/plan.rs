//! Plan model, structural diffs, and local (incremental) restructuring.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::core::types::{DeferReason, UnitId};

/// Blocked units with at least this many steps are split instead of deferred.
pub const SPLIT_MIN_STEPS: usize = 4;

/// One unit of work in the plan file.
///
/// Fields this program does not own are kept in `extra` so rewrites never
/// drop data written by other tools or by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUnit {
    pub id: UnitId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub tested: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_reason: Option<DeferReason>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl PlanUnit {
    pub fn new(id: UnitId, description: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            id,
            description: description.into(),
            steps,
            tested: false,
            deferred: false,
            defer_reason: None,
            extra: Map::new(),
        }
    }

    /// Not yet tested and not set aside.
    pub fn is_open(&self) -> bool {
        !self.tested && !self.deferred
    }
}

pub type Plan = Vec<PlanUnit>;

/// Structural change between two plans, keyed by unit id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanDiff {
    pub added: Vec<UnitId>,
    pub removed: Vec<UnitId>,
    pub modified: Vec<UnitId>,
}

impl PlanDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Ids that exist in the new plan and changed shape.
    pub fn touched(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.added.iter().chain(&self.modified).copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} modified",
            self.added.len(),
            self.removed.len(),
            self.modified.len()
        )
    }
}

/// Compare plans by id. A unit is modified when any field differs; pure
/// reordering does not count as a structural change.
pub fn diff_plans(old: &[PlanUnit], new: &[PlanUnit]) -> PlanDiff {
    let old_by_id: BTreeMap<UnitId, &PlanUnit> = old.iter().map(|unit| (unit.id, unit)).collect();
    let new_by_id: BTreeMap<UnitId, &PlanUnit> = new.iter().map(|unit| (unit.id, unit)).collect();

    let mut diff = PlanDiff::default();
    for (id, unit) in &new_by_id {
        match old_by_id.get(id) {
            None => diff.added.push(*id),
            Some(previous) if previous != unit => diff.modified.push(*id),
            Some(_) => {}
        }
    }
    diff.removed = old_by_id
        .keys()
        .filter(|id| !new_by_id.contains_key(id))
        .copied()
        .collect();
    diff
}

/// Semantic checks JSON Schema cannot express.
pub fn validate_plan_invariants(plan: &[PlanUnit]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for unit in plan {
        if !seen.insert(unit.id) {
            errors.push(format!("duplicate unit id {}", unit.id));
        }
        if unit.defer_reason.is_some() && !unit.deferred {
            errors.push(format!(
                "unit {}: defer_reason set but deferred is false",
                unit.id
            ));
        }
    }
    errors
}

/// SHA-256 over what each unit asks for (id, description, steps).
///
/// Progress flags (`tested`, `deferred`) and formatting are ignored, so only
/// edits to the requirements themselves change the fingerprint.
pub fn requirements_fingerprint(plan: &[PlanUnit]) -> String {
    let view: Vec<Value> = plan
        .iter()
        .map(|unit| json!([unit.id, unit.description, unit.steps]))
        .collect();
    let canonical = Value::Array(view).to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

pub fn find_unit(plan: &[PlanUnit], id: UnitId) -> Option<&PlanUnit> {
    plan.iter().find(|unit| unit.id == id)
}

/// Mark a unit deferred in place. Returns false if the id is unknown.
pub fn mark_deferred(plan: &mut [PlanUnit], id: UnitId, reason: DeferReason) -> bool {
    match plan.iter_mut().find(|unit| unit.id == id) {
        Some(unit) => {
            unit.deferred = true;
            unit.defer_reason = Some(reason);
            true
        }
        None => false,
    }
}

/// Inputs for the incremental restructuring.
#[derive(Debug, Clone, Default)]
pub struct IncrementalInput {
    /// Unit that was failing when the trigger fired.
    pub current_unit: Option<UnitId>,
    /// Split the current unit when it is large enough.
    pub split_current: bool,
    pub blocked: BTreeSet<UnitId>,
}

/// Adjust the plan locally without calling the agent.
///
/// - Large blocked units (and the current unit when `split_current`) are
///   split in two; the second half gets a fresh id.
/// - Other blocked open units move to the end, deferred for complexity.
pub fn incremental_replan(plan: &[PlanUnit], input: &IncrementalInput) -> Plan {
    let mut next_id = plan.iter().map(|unit| unit.id).max().unwrap_or(0) + 1;
    let mut kept = Vec::with_capacity(plan.len() + 1);
    let mut moved = Vec::new();

    for unit in plan {
        let blocked = input.blocked.contains(&unit.id);
        let current = input.split_current && input.current_unit == Some(unit.id);
        if !unit.is_open() || !(blocked || current) {
            kept.push(unit.clone());
            continue;
        }
        if unit.steps.len() >= SPLIT_MIN_STEPS {
            let (first, second) = split_unit(unit, next_id);
            next_id += 1;
            kept.push(first);
            kept.push(second);
        } else if blocked {
            let mut deferred = unit.clone();
            deferred.deferred = true;
            deferred.defer_reason = Some(DeferReason::Complexity);
            moved.push(deferred);
        } else {
            kept.push(unit.clone());
        }
    }

    kept.extend(moved);
    kept
}

fn split_unit(unit: &PlanUnit, new_id: UnitId) -> (PlanUnit, PlanUnit) {
    let mid = unit.steps.len().div_ceil(2);
    let mut first = unit.clone();
    first.steps = unit.steps[..mid].to_vec();
    first.description = format!("{} (part 1)", unit.description);

    let mut second = unit.clone();
    second.id = new_id;
    second.steps = unit.steps[mid..].to_vec();
    second.description = format!("{} (part 2)", unit.description);
    (first, second)
}

/// Pull a JSON array out of free-form agent output.
///
/// Accepts a bare array or one wrapped in a fenced code block with prose
/// around it.
pub fn extract_json_array(output: &str) -> Option<&str> {
    let fenced = output
        .split("```")
        .skip(1)
        .step_by(2)
        .map(|block| block.trim_start_matches("json").trim())
        .find(|block| block.starts_with('['));
    if fenced.is_some() {
        return fenced;
    }
    let start = output.find('[')?;
    let end = output.rfind(']')?;
    (end > start).then(|| &output[start..=end])
}
