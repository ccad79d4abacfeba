//! Deterministic selection of the next unit to work on.

use std::collections::BTreeSet;

use crate::core::plan::PlanUnit;
use crate::core::types::UnitId;

/// First unit in plan order that is open and not skipped in this run.
///
/// Returns `None` when nothing is left to do.
pub fn next_open_unit<'a>(plan: &'a [PlanUnit], skipped: &BTreeSet<UnitId>) -> Option<&'a PlanUnit> {
    plan.iter()
        .find(|unit| unit.is_open() && !skipped.contains(&unit.id))
}
