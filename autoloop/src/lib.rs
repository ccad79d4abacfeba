//! Adaptive control loop around an external AI coding agent.
//!
//! Each iteration hands one plan unit to the agent, classifies what came
//! back, and decides whether to continue, retry with guidance, skip the unit,
//! roll back the working tree, defer the unit, or restructure the plan.
//!
//! - **[`core`]**: pure logic (classification, failure tracking, budgets,
//!   plan diffs). No I/O.
//! - **[`io`]**: filesystem, processes, and git, isolated behind small
//!   traits so tests can script them.
//!
//! [`recovery`], [`replan`] and [`looping`] combine the two into the
//! managers the `autoloop` CLI drives.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod recovery;
pub mod replan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
