//! Guidance text injected into the next prompt after a failure.

use crate::core::types::{Failure, FailureType};

/// Retry guidance for a failure, specific to its type.
///
/// `failure.retry_count` failed attempts have been recorded, so the prompt
/// this text goes into is attempt `retry_count + 1` of `max_retries`.
pub fn retry_guidance(failure: &Failure, max_retries: u32) -> String {
    let focus = match failure.failure_type {
        FailureType::TestFailure => {
            "Tests failed on the previous attempt. Fix the failing tests first:\n\
             - Read the failing assertion and reproduce it locally.\n\
             - Fix the implementation, not the test, unless the test is wrong.\n\
             - Run the full test suite before declaring the unit done."
        }
        FailureType::TypecheckFailure => {
            "The code did not compile or type-check. Fix compilation first:\n\
             - Resolve missing imports, undefined names and type mismatches.\n\
             - Do not add new functionality until the build is green.\n\
             - Re-run the type checker or build after each fix."
        }
        FailureType::Timeout => {
            "The previous attempt timed out. Simplify and break the work down:\n\
             - Implement the smallest piece that makes progress.\n\
             - Avoid long-running commands and watch modes.\n\
             - Leave remaining steps for the next iteration."
        }
        FailureType::AgentError => {
            "The previous attempt ended with an error. Review the root cause:\n\
             - Read the error output before changing code.\n\
             - Check that required tools and files exist.\n\
             - Take a different approach if the same step failed before."
        }
        FailureType::None => {
            "The previous attempt did not succeed. Review what went wrong and try again."
        }
    };
    format!(
        "## Recovery guidance (attempt {} of {})\n\n{}\n\nLast failure: {}\n",
        failure.retry_count + 1,
        max_retries,
        focus,
        failure.message
    )
}

/// Guidance after the working tree was rolled back.
pub fn rollback_guidance(failure: &Failure, max_retries: u32) -> String {
    format!(
        "## Changes rolled back\n\n\
         Uncommitted changes from the previous attempt were discarded because of a {}.\n\
         Start again from the last commit with a smaller, safer change.\n\n{}",
        failure.failure_type,
        retry_guidance(failure, max_retries)
    )
}

/// One-time hint for units that look too large for the iteration budget.
pub fn simplification_hint() -> &'static str {
    "## Keep it simple\n\n\
     This unit looks large for its iteration budget. Implement the minimal version that \
     satisfies the steps, skip optional polish, and mark the unit tested as soon as it works.\n"
}
