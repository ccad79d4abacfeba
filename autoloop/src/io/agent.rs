//! Agent invocation.
//!
//! The [`AgentRunner`] trait decouples the loop from the actual agent
//! backend (any CLI that reads a prompt on stdin). Tests use scripted agents
//! that return predetermined outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Maximum time to wait for the agent to finish.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Where to keep a transcript of the invocation, if anywhere.
    pub log_path: Option<PathBuf>,
}

/// What the agent produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
}

/// Abstraction over agent backends.
pub trait AgentRunner {
    /// Run the agent to completion or timeout. Only failures to run at all are errors; a
    /// non-zero exit is reported through [`AgentOutcome::exit_code`].
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome>;
}

/// Agent that spawns the configured command line and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("agent command must not be empty"));
        }
        Ok(Self { command })
    }
}

impl AgentRunner for CommandAgent {
    #[instrument(skip_all, fields(program = %self.command[0], timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        info!(workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {}", self.command.join(" ")))?;

        if let Some(log_path) = &request.log_path {
            write_agent_log(log_path, request, &output)?;
        }

        let mut text = output.combined_text();
        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "agent timed out"
            );
            text.push_str(&format!(
                "\nagent timed out after {}s\n",
                request.timeout.as_secs()
            ));
        }

        let exit_code = output.exit_code();
        debug!(exit_code, bytes = text.len(), "agent finished");
        Ok(AgentOutcome {
            exit_code,
            output: text,
            timed_out: output.timed_out,
        })
    }
}

fn write_agent_log(path: &Path, request: &AgentRequest, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== prompt ===\n");
    buf.push_str(&request.prompt);
    buf.push_str("\n=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    if output.stdout_truncated > 0 {
        buf.push_str(&format!("\n[truncated {} bytes]\n", output.stdout_truncated));
    }
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.stderr_truncated > 0 {
        buf.push_str(&format!("\n[truncated {} bytes]\n", output.stderr_truncated));
    }
    buf.push_str(&format!("\n=== exit: {} ===\n", output.exit_code()));
    if output.timed_out {
        buf.push_str("[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(root: &Path, timeout: Duration) -> AgentRequest {
        AgentRequest {
            workdir: root.to_path_buf(),
            prompt: "do the work".to_string(),
            timeout,
            output_limit_bytes: 10_000,
            log_path: Some(root.join("logs").join("agent.log")),
        }
    }

    fn sh(script: &str) -> CommandAgent {
        CommandAgent::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
            .expect("agent")
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandAgent::new(Vec::new()).is_err());
    }

    #[test]
    fn passes_prompt_on_stdin_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_secs(10));
        let outcome = sh("cat; echo; echo 'warn' >&2").run(&req).expect("run");

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        assert!(outcome.output.starts_with("do the work"));
        assert!(outcome.output.contains("warn"));

        let log = fs::read_to_string(req.log_path.as_ref().expect("log path")).expect("read log");
        assert!(log.contains("=== prompt ===\ndo the work"));
        assert!(log.contains("=== exit: 0 ==="));
    }

    #[test]
    fn nonzero_exit_is_an_outcome_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sh("echo 'tests failed'; exit 1")
            .run(&request(temp.path(), Duration::from_secs(10)))
            .expect("run");
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.output, "tests failed\n");
    }

    #[test]
    fn timeout_is_reported_in_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sh("sleep 5")
            .run(&request(temp.path(), Duration::from_millis(200)))
            .expect("run");
        assert!(outcome.timed_out);
        assert!(outcome.output.contains("agent timed out"));
        assert_ne!(outcome.exit_code, 0);
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = CommandAgent::new(vec!["autoloop-no-such-agent".to_string()]).expect("agent");
        let err = agent
            .run(&request(temp.path(), Duration::from_secs(1)))
            .unwrap_err();
        assert!(format!("{err:#}").contains("run agent"));
    }
}
