//! `autoloop`: drive an AI coding agent through a plan, one unit per
//! iteration, with failure recovery, budgets, and replanning.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use autoloop::core::classifier::{classify_output, extract_message};
use autoloop::core::selector::next_open_unit;
use autoloop::core::types::{FailureType, RecoveryStrategyKind, ReplanStrategy};
use autoloop::exit_codes;
use autoloop::io::agent::CommandAgent;
use autoloop::io::config::{LoopConfig, load_config};
use autoloop::io::git::Git;
use autoloop::io::paths::{InitOptions, LoopPaths, init_project};
use autoloop::io::plan_store::{list_versions, load_plan, restore_backup};
use autoloop::logging;
use autoloop::looping::{IterationReport, LoopOutcome, LoopSettings, LoopStop, run_loop};
use autoloop::replan::{ReplanManager, ReplanSettings};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Adaptive build loop around an AI coding agent"
)]
struct Cli {
    /// Project root (holds `.autoloop/` and the plan).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log at info level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autoloop/` with a default config and an empty plan if missing.
    Init {
        /// Overwrite existing autoloop files (never the plan).
        #[arg(short, long)]
        force: bool,
    },
    /// Run iterations until the plan is done, the deadline passes, or a limit is hit.
    Run {
        #[command(flatten)]
        overrides: RunOverrides,
        /// Print the final summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Back up and restructure the plan now.
    Replan {
        /// Strategy to use (defaults to the configured one).
        #[arg(long)]
        strategy: Option<ReplanStrategy>,
    },
    /// List plan backups.
    Versions,
    /// Restore plan backup N (the live plan is backed up first).
    Restore { version: u32 },
    /// Classify agent output from FILE (or stdin) and print the failure type.
    Classify {
        /// Exit code the agent returned.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        exit_code: i32,
        file: Option<PathBuf>,
    },
    /// Show plan progress and backups.
    Status {
        #[arg(long)]
        json: bool,
    },
}

/// Per-run overrides for `.autoloop/config.toml`.
#[derive(Args, Debug, Default)]
struct RunOverrides {
    #[arg(long)]
    max_retries: Option<u32>,
    /// retry | skip | rollback
    #[arg(long)]
    recovery_strategy: Option<RecoveryStrategyKind>,
    /// Iterations per unit before deferral (0 = unlimited).
    #[arg(long)]
    scope_limit: Option<u32>,
    /// Run deadline from now, e.g. `2h`, `1h30m`, `45m`.
    #[arg(long)]
    deadline: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    auto_defer: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    auto_replan: Option<bool>,
    /// incremental | agent | none
    #[arg(long)]
    replan_strategy: Option<ReplanStrategy>,
    #[arg(long)]
    replan_threshold: Option<u32>,
    /// Total iterations for this run (0 = unlimited).
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    iteration_timeout_secs: Option<u64>,
    #[arg(long)]
    agent_output_limit_bytes: Option<usize>,
    /// Agent command line, split on whitespace (e.g. "claude -p").
    #[arg(long)]
    agent_command: Option<String>,
    #[arg(long)]
    plan: Option<PathBuf>,
    #[arg(long)]
    progress: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(self, config: &mut LoopConfig) {
        if let Some(value) = self.max_retries {
            config.max_retries = value;
        }
        if let Some(value) = self.recovery_strategy {
            config.recovery_strategy = value;
        }
        if let Some(value) = self.scope_limit {
            config.scope_limit = value;
        }
        if let Some(value) = self.deadline {
            config.deadline = value;
        }
        if let Some(value) = self.auto_defer {
            config.auto_defer = value;
        }
        if let Some(value) = self.auto_replan {
            config.auto_replan = value;
        }
        if let Some(value) = self.replan_strategy {
            config.replan_strategy = value;
        }
        if let Some(value) = self.replan_threshold {
            config.replan_threshold = value;
        }
        if let Some(value) = self.max_iterations {
            config.max_iterations = value;
        }
        if let Some(value) = self.iteration_timeout_secs {
            config.iteration_timeout_secs = value;
        }
        if let Some(value) = self.agent_output_limit_bytes {
            config.agent_output_limit_bytes = value;
        }
        if let Some(value) = self.agent_command {
            config.agent.command = value.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = self.plan {
            config.plan_path = value;
        }
        if let Some(value) = self.progress {
            config.progress_path = value;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Run { overrides, json } => cmd_run(root, overrides, json),
        Command::Replan { strategy } => cmd_replan(root, strategy),
        Command::Versions => cmd_versions(root),
        Command::Restore { version } => cmd_restore(root, version),
        Command::Classify { exit_code, file } => cmd_classify(file.as_deref(), exit_code),
        Command::Status { json } => cmd_status(root, json),
    }
}

fn load_project(root: &Path) -> Result<(LoopConfig, LoopPaths)> {
    let config_path = LoopPaths::new(root).config_path;
    let config = load_config(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let paths = LoopPaths::with_config(root, &config);
    Ok((config, paths))
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, overrides: RunOverrides, json: bool) -> Result<i32> {
    let (mut config, _) = load_project(root)?;
    overrides.apply(&mut config);
    config.validate().context("invalid run settings")?;
    let paths = LoopPaths::with_config(root, &config);
    let settings = LoopSettings::from_config(&config, Utc::now())?;
    let agent = CommandAgent::new(config.agent.command.clone())?;

    let outcome = run_loop(&paths, &settings, &agent, Git::new(root), |report| {
        if !json {
            print_iteration(report);
        }
    })?;

    if json {
        print_json(&outcome)?;
    } else {
        print_summary(&outcome);
    }
    Ok(run_exit_code(&outcome))
}

fn run_exit_code(outcome: &LoopOutcome) -> i32 {
    match outcome.stop {
        LoopStop::Deadline => exit_codes::DEADLINE,
        LoopStop::MaxIterations => exit_codes::INCOMPLETE,
        LoopStop::Complete if outcome.is_clean() => exit_codes::OK,
        LoopStop::Complete => exit_codes::INCOMPLETE,
    }
}

fn print_iteration(report: &IterationReport) {
    let failure = match report.failure {
        Some(failure_type) => format!(" [{failure_type}, retry {}]", report.retry_count),
        None => String::new(),
    };
    println!(
        "iteration {}: unit #{} {}{}: {}",
        report.iteration,
        report.unit_id,
        report.action.as_str(),
        failure,
        report.message
    );
    if let Some(replan) = &report.replan {
        let backup = replan
            .backup_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  replan ({}): {} (backup {})",
            replan.trigger, replan.message, backup
        );
    }
}

fn print_summary(outcome: &LoopOutcome) {
    let summary = &outcome.summary;
    println!("stopped: {}", outcome.stop.as_str());
    println!("iterations: {}", summary.iterations);
    println!("completed: {}", format_ids(&summary.completed));
    println!("failed: {}", format_ids(&summary.failed));
    println!("skipped: {}", format_ids(&summary.skipped));
    println!("deferred: {}", format_ids(&summary.deferred));
    println!(
        "failures: {} total, {} recovered",
        summary.total_failures, summary.recovered
    );
    println!("replans: {}", summary.replans);
}

fn format_ids(ids: &[u32]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn cmd_replan(root: &Path, strategy: Option<ReplanStrategy>) -> Result<i32> {
    let (config, paths) = load_project(root)?;
    let agent = CommandAgent::new(config.agent.command.clone())?;
    let mut manager = ReplanManager::new(
        &paths,
        &agent,
        ReplanSettings {
            auto_replan: config.auto_replan,
            threshold: config.replan_threshold,
            agent_timeout: config.iteration_timeout(),
            output_limit_bytes: config.agent_output_limit_bytes,
        },
    )?;
    let result = manager.manual_replan(strategy.unwrap_or(config.replan_strategy))?;
    if let Some(backup) = &result.backup_path {
        println!("backup: {}", backup.display());
    }
    if !result.success {
        bail!("{}", result.message);
    }
    println!("{}", result.message);
    Ok(exit_codes::OK)
}

fn cmd_versions(root: &Path) -> Result<i32> {
    let (_, paths) = load_project(root)?;
    let versions = list_versions(&paths.plan_path)?;
    if versions.is_empty() {
        println!("no backups");
    }
    for version in versions {
        println!(
            "{}\t{}\t{}\t{}",
            version.version,
            version.timestamp.to_rfc3339(),
            version.cause,
            version.path.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_restore(root: &Path, version: u32) -> Result<i32> {
    let (_, paths) = load_project(root)?;
    let safety = restore_backup(&paths.plan_path, version)?;
    println!("restored version {version}");
    if let Some(safety) = safety {
        println!("previous plan saved as version {}", safety.version);
    }
    Ok(exit_codes::OK)
}

fn cmd_classify(file: Option<&Path>, exit_code: i32) -> Result<i32> {
    let output = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    let failure_type = classify_output(&output, exit_code);
    if failure_type == FailureType::None {
        println!("none");
    } else {
        println!(
            "{failure_type}: {}",
            extract_message(&output, failure_type, exit_code)
        );
    }
    Ok(exit_codes::OK)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    plan_path: PathBuf,
    total: usize,
    tested: usize,
    deferred: usize,
    open: usize,
    next_unit: Option<u32>,
    backups: usize,
    config: LoopConfig,
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let (config, paths) = load_project(root)?;
    let plan = load_plan(&paths.plan_path)?;
    let report = StatusReport {
        plan_path: paths.plan_path.clone(),
        total: plan.len(),
        tested: plan.iter().filter(|unit| unit.tested).count(),
        deferred: plan.iter().filter(|unit| unit.deferred).count(),
        open: plan.iter().filter(|unit| unit.is_open()).count(),
        next_unit: next_open_unit(&plan, &Default::default()).map(|unit| unit.id),
        backups: list_versions(&paths.plan_path)?.len(),
        config,
    };

    if json {
        print_json(&report)?;
        return Ok(exit_codes::OK);
    }
    println!("plan: {}", report.plan_path.display());
    println!(
        "units: {} total, {} tested, {} deferred, {} open",
        report.total, report.tested, report.deferred, report.open
    );
    match report.next_unit {
        Some(id) => println!("next: unit #{id}"),
        None => println!("next: -"),
    }
    println!("backups: {}", report.backups);
    println!(
        "recovery: {} (max retries {}), replan: {} (auto {}, threshold {})",
        report.config.recovery_strategy,
        report.config.max_retries,
        report.config.replan_strategy,
        report.config.auto_replan,
        report.config.replan_threshold
    );
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
