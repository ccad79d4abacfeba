//! Git adapter for the rollback recovery strategy.
//!
//! Only three questions are ever asked of version control: is this a work
//! tree, are there uncommitted tracked changes, and discard them. We keep a
//! small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Version-control operations needed by rollback.
pub trait WorkingTree {
    fn is_work_tree(&self) -> Result<bool>;
    /// True if any tracked file is modified, staged, or deleted.
    fn has_uncommitted_changes(&self) -> Result<bool>;
    /// Unstage and revert tracked files. Untracked files are left alone.
    fn discard_tracked_changes(&self) -> Result<()>;
}

impl<W: WorkingTree + ?Sized> WorkingTree for &W {
    fn is_work_tree(&self) -> Result<bool> {
        (**self).is_work_tree()
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        (**self).has_uncommitted_changes()
    }

    fn discard_tracked_changes(&self) -> Result<()> {
        (**self).discard_tracked_changes()
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl WorkingTree for Git {
    fn is_work_tree(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        let inside =
            output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true";
        debug!(inside, workdir = %self.workdir.display(), "checked work tree");
        Ok(inside)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let tracked = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !entry.is_untracked())
            .count();
        debug!(tracked, "tracked changes");
        Ok(tracked > 0)
    }

    #[instrument(skip_all)]
    fn discard_tracked_changes(&self) -> Result<()> {
        warn!(workdir = %self.workdir.display(), "discarding tracked changes");
        self.run_checked(&["reset", "--quiet", "HEAD", "--", "."])?;
        self.run_checked(&["checkout", "--", "."])?;
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
