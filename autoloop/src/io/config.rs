//! Loop configuration stored under `.autoloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{RecoveryStrategyKind, ReplanStrategy};

static DURATION_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").unwrap());

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults and
/// every field can be overridden from the `run` command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Attempts per unit: the `max_retries`-th failure escalates to skip,
    /// so a unit runs at most `max_retries` times (once when 0).
    pub max_retries: u32,

    pub recovery_strategy: RecoveryStrategyKind,

    /// Iterations allowed per unit before deferral (0 = unlimited).
    pub scope_limit: u32,

    /// Run deadline as a duration from start (`2h`, `1h30m`, `45m`). Empty = unset.
    pub deadline: String,

    /// Defer units automatically when their budget runs out.
    pub auto_defer: bool,

    pub auto_replan: bool,

    pub replan_strategy: ReplanStrategy,

    /// Consecutive failures that trigger a replan.
    pub replan_threshold: u32,

    /// Total iterations for the whole run (0 = unlimited).
    pub max_iterations: u32,

    /// Wall-clock budget for one agent invocation, in seconds.
    pub iteration_timeout_secs: u64,

    /// Truncate captured agent output beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Plan file, relative to the project root.
    pub plan_path: PathBuf,

    /// Append-only progress log, relative to the project root.
    pub progress_path: PathBuf,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line; the prompt is written to its stdin.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            recovery_strategy: RecoveryStrategyKind::Retry,
            scope_limit: 0,
            deadline: String::new(),
            auto_defer: true,
            auto_replan: false,
            replan_strategy: ReplanStrategy::Incremental,
            replan_threshold: 3,
            max_iterations: 0,
            iteration_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 200_000,
            plan_path: PathBuf::from("plan.json"),
            progress_path: PathBuf::from("progress.txt"),
            agent: AgentConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replan_threshold == 0 {
            return Err(anyhow!("replan_threshold must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.plan_path.as_os_str().is_empty() {
            return Err(anyhow!("plan_path must not be empty"));
        }
        self.deadline_duration()
            .with_context(|| format!("invalid deadline '{}'", self.deadline))?;
        Ok(())
    }

    /// Parsed `deadline`, or `None` when unset.
    pub fn deadline_duration(&self) -> Result<Option<Duration>> {
        let trimmed = self.deadline.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        parse_duration(trimmed).map(Some)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Parse a duration string made of `<n>h`, `<n>m`, `<n>s` and `<n>ms` parts
/// (`2h`, `1h30m`, `90s`). A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0usize;
    for caps in DURATION_PART_RE.captures_iter(input) {
        let (Some(whole), Some(value), Some(unit)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if whole.start() != consumed {
            return Err(anyhow!("unexpected text in duration '{input}'"));
        }
        consumed = whole.end();
        let value: u64 = value
            .as_str()
            .parse()
            .with_context(|| format!("parse duration value in '{input}'"))?;
        let part = match unit.as_str() {
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(value)),
            _ => Some(Duration::from_millis(value)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| anyhow!("duration '{input}' out of range"))?;
    }
    if consumed != input.len() {
        return Err(anyhow!(
            "invalid duration '{input}' (expected e.g. 2h, 1h30m, 45s)"
        ));
    }
    Ok(total)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = LoopConfig {
            recovery_strategy: RecoveryStrategyKind::Rollback,
            deadline: "1h30m".to_string(),
            auto_replan: true,
            ..LoopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_retries = 5\nreplan_strategy = \"agent\"\n[agent]\ncommand = [\"codex\", \"exec\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.replan_strategy, ReplanStrategy::Agent);
        assert_eq!(cfg.agent.command, vec!["codex", "exec"]);
        assert_eq!(cfg.replan_threshold, 3);
    }

    #[test]
    fn rejects_zero_threshold_and_bad_deadline() {
        let zero = LoopConfig {
            replan_threshold: 0,
            ..LoopConfig::default()
        };
        assert!(zero.validate().is_err());

        let bad = LoopConfig {
            deadline: "soon".to_string(),
            ..LoopConfig::default()
        };
        let err = bad.validate().unwrap_err();
        assert!(format!("{err:#}").contains("invalid deadline"));
    }

    #[test]
    fn parses_duration_strings() {
        assert_eq!(parse_duration("2h").expect("2h"), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1h30m").expect("1h30m"),
            Duration::from_secs(5400)
        );
        assert_eq!(parse_duration("45s").expect("45s"), Duration::from_secs(45));
        assert_eq!(
            parse_duration("1m500ms").expect("1m500ms"),
            Duration::from_millis(60_500)
        );
        assert_eq!(parse_duration("90").expect("90"), Duration::from_secs(90));
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("h1").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn oversized_durations_are_errors() {
        let err = parse_duration("5124095576030432h").expect_err("overflow");
        assert!(err.to_string().contains("out of range"));
        assert!(parse_duration("18446744073709551615s1s").is_err());
    }
}
