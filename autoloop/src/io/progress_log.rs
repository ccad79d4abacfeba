//! Append-only progress log shared with the agent.
//!
//! One line per event. The formats are stable: agents and humans grep them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::core::types::{DeferReason, Failure, ReplanStrategy, ReplanTrigger, UnitId};

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn failure(&self, failure: &Failure) -> Result<()> {
        self.append(&failure_line(failure))
    }

    pub fn deferred(&self, unit_id: UnitId, reason: DeferReason) -> Result<()> {
        self.append(&format!("DEFERRED: unit #{unit_id} ({reason})"))
    }

    pub fn replan(&self, trigger: ReplanTrigger, strategy: ReplanStrategy) -> Result<()> {
        self.append(&format!(
            "REPLAN: {} triggered, strategy: {}",
            trigger.as_str(),
            strategy.as_str()
        ))
    }

    pub fn complete(&self, unit_id: UnitId) -> Result<()> {
        self.append(&format!("COMPLETE: unit #{unit_id}"))
    }

    pub fn skipped(&self, unit_id: UnitId, failures: usize) -> Result<()> {
        self.append(&format!("SKIPPED: unit #{unit_id} after {failures} failures"))
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("append progress log {}", self.path.display()))
    }
}

pub fn failure_line(failure: &Failure) -> String {
    format!(
        "FAILURE [{}]: {} (unit #{}, retry {})",
        failure.failure_type.as_str(),
        failure.message,
        failure.unit_id,
        failure.retry_count
    )
}
