//! Canonical paths and `.autoloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{LoopConfig, write_config};

/// All canonical paths for a project root.
///
/// The plan and progress files live where the config says; everything this
/// program owns lives under `.autoloop/`.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
}

impl LoopPaths {
    /// Paths with the default plan/progress locations.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, &LoopConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: &LoopConfig) -> Self {
        let root = root.into();
        let state_dir = root.join(".autoloop");
        Self {
            iterations_dir: state_dir.join("iterations"),
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join("config.toml"),
            plan_path: root.join(&config.plan_path),
            progress_path: root.join(&config.progress_path),
            state_dir,
            root,
        }
    }

    /// Agent transcript for one iteration.
    pub fn agent_log_path(&self, iteration: u32) -> PathBuf {
        self.iterations_dir
            .join(iteration.to_string())
            .join("agent.log")
    }

    /// Agent transcript for a replan invocation.
    pub fn replan_log_path(&self, version: u32) -> PathBuf {
        self.iterations_dir
            .join(format!("replan-{version}"))
            .join("agent.log")
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing autoloop-owned files.
    pub force: bool,
}

/// Create `.autoloop/` scaffolding and an empty plan if none exists.
///
/// Fails if `.autoloop/` already exists unless `options.force` is set. An
/// existing plan file is never overwritten.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<LoopPaths> {
    let paths = LoopPaths::new(root);
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "autoloop init: .autoloop already exists (use --force to overwrite)"
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "autoloop init: .autoloop exists but is not a directory"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.iterations_dir)?;
    write_file(&paths.gitignore_path, GITIGNORE)?;
    write_config(&paths.config_path, &LoopConfig::default())?;
    if !paths.plan_path.exists() {
        write_file(&paths.plan_path, EMPTY_PLAN)?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const GITIGNORE: &str = "iterations/\n";
const EMPTY_PLAN: &str = "[]\n";
