//! Shared time budget helpers for the run deadline.

use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};

/// Time left until `deadline`, saturating at zero.
pub fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Timeout for one agent invocation: the per-iteration timeout, capped by
/// whatever is left before the run deadline.
pub fn iteration_budget(
    iteration_timeout: Duration,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Duration> {
    let Some(deadline) = deadline else {
        return Ok(iteration_timeout);
    };
    let remaining = remaining_until(deadline, now);
    if remaining.is_zero() {
        return Err(anyhow!("run deadline reached"));
    }
    Ok(iteration_timeout.min(remaining))
}
