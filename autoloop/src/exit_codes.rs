//! Stable exit codes for autoloop CLI commands.

/// Command succeeded, or `run` finished with every open unit done or deferred.
pub const OK: i32 = 0;
/// Invalid config, plan, or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `run` stopped with work left: units skipped or the iteration limit hit.
pub const INCOMPLETE: i32 = 2;
/// `run` stopped because the deadline passed.
pub const DEADLINE: i32 = 3;
