//! Side-effecting helpers: files, processes, git.

pub mod agent;
pub mod config;
pub mod git;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod progress_log;
pub mod prompt;
