//! Plan load/save with schema + invariant validation, and numbered backups.
//!
//! Backups sit next to the plan as `<plan>.bak.<N>`. Their metadata lives in
//! `<plan>.versions.json`; a backup file missing from the index is still
//! listed, with its modification time and an `unknown` cause.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::plan::{Plan, validate_plan_invariants};

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/plan.schema.json"
));

/// Cause recorded for the safety backup taken before a restore.
pub const RESTORE_CAUSE: &str = "restore";
/// Backup cause for a plan the agent left unloadable.
pub const INVALID_PLAN_CAUSE: &str = "invalid_plan";

/// One entry in the backup chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanVersion {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// Trigger name, `manual`, or `restore`.
    pub cause: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Load and validate the plan from disk (schema + invariants).
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan_str(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Parse and validate plan JSON held in memory.
pub fn parse_plan_str(contents: &str) -> Result<Plan> {
    let value: Value = serde_json::from_str(contents).context("parse plan json")?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value).context("deserialize plan")?;
    let errors = validate_plan_invariants(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    Ok(plan)
}

/// Atomically write the plan (temp file + rename).
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

pub fn backup_path(plan_path: &Path, version: u32) -> PathBuf {
    sibling(plan_path, &format!(".bak.{version}"))
}

fn index_path(plan_path: &Path) -> PathBuf {
    sibling(plan_path, ".versions.json")
}

/// All backups that exist on disk, oldest first.
pub fn list_versions(plan_path: &Path) -> Result<Vec<PlanVersion>> {
    let mut versions: Vec<PlanVersion> = read_index(plan_path)?
        .into_iter()
        .map(|mut entry| {
            entry.path = backup_path(plan_path, entry.version);
            entry
        })
        .filter(|entry| entry.path.is_file())
        .collect();

    for version in backups_on_disk(plan_path)? {
        if versions.iter().any(|entry| entry.version == version) {
            continue;
        }
        let path = backup_path(plan_path, version);
        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat backup {}", path.display()))?;
        versions.push(PlanVersion {
            version,
            timestamp: DateTime::<Utc>::from(modified),
            cause: "unknown".to_string(),
            path,
        });
    }

    versions.sort_by_key(|entry| entry.version);
    Ok(versions)
}

/// Copy the live plan to the next numbered backup and record it in the index.
///
/// Version numbers only grow: the next number is one past the highest seen
/// either on disk or in the index.
#[instrument(skip_all, fields(plan = %plan_path.display(), cause = cause))]
pub fn create_backup(plan_path: &Path, cause: &str) -> Result<PlanVersion> {
    let bytes = fs::read(plan_path)
        .with_context(|| format!("read plan {} for backup", plan_path.display()))?;

    let mut index = read_index(plan_path)?;
    let highest_indexed = index.iter().map(|entry| entry.version).max().unwrap_or(0);
    let highest_on_disk = backups_on_disk(plan_path)?.into_iter().max().unwrap_or(0);
    let version = highest_indexed.max(highest_on_disk) + 1;

    let path = backup_path(plan_path, version);
    fs::write(&path, &bytes).with_context(|| format!("write backup {}", path.display()))?;

    let entry = PlanVersion {
        version,
        timestamp: Utc::now(),
        cause: cause.to_string(),
        path,
    };
    index.push(entry.clone());
    write_index(plan_path, &index)?;

    info!(version, "plan backed up");
    Ok(entry)
}

/// Replace the live plan with backup `version`.
///
/// The live plan is backed up first (cause `restore`) so a restore can itself
/// be undone. Returns that safety backup, if one was taken.
#[instrument(skip_all, fields(plan = %plan_path.display(), version = version))]
pub fn restore_backup(plan_path: &Path, version: u32) -> Result<Option<PlanVersion>> {
    let source = backup_path(plan_path, version);
    if !source.is_file() {
        return Err(anyhow!("plan version {version} not found"));
    }
    let bytes = fs::read(&source).with_context(|| format!("read backup {}", source.display()))?;

    let safety = if plan_path.exists() {
        Some(create_backup(plan_path, RESTORE_CAUSE)?)
    } else {
        None
    };
    write_atomic(plan_path, &bytes)?;
    info!("plan restored");
    Ok(safety)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid plan schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn read_index(plan_path: &Path) -> Result<Vec<PlanVersion>> {
    let path = index_path(plan_path);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("read version index {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse version index {}", path.display()))
}

fn write_index(plan_path: &Path, index: &[PlanVersion]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(index).context("serialize version index")?;
    buf.push('\n');
    write_atomic(&index_path(plan_path), buf.as_bytes())
}

/// Version numbers of `<plan>.bak.<N>` files next to the plan.
fn backups_on_disk(plan_path: &Path) -> Result<Vec<u32>> {
    let Some(file_name) = plan_path.file_name().and_then(|name| name.to_str()) else {
        return Err(anyhow!("plan path has no file name: {}", plan_path.display()));
    };
    let prefix = format!("{file_name}.bak.");
    let dir = match plan_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut versions = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let name = entry.file_name();
        if let Some(version) = name
            .to_str()
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<u32>().ok())
        {
            versions.push(version);
        }
    }
    debug!(count = versions.len(), "scanned backups");
    Ok(versions)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = sibling(path, ".tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
