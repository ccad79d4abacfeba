//! Shared deterministic types for the control loop.
//!
//! These types define stable contracts between the classifier, the recovery,
//! scope and replan managers, and the plan file. String forms are part of the
//! on-disk format (plan file, progress log, config) and must stay stable.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a plan unit (the `id` field of the plan file).
pub type UnitId = u32;

/// Closed failure taxonomy. Anything unclassified is treated as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    None,
    TestFailure,
    TypecheckFailure,
    AgentError,
    Timeout,
}

impl FailureType {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureType::None => "none",
            FailureType::TestFailure => "test_failure",
            FailureType::TypecheckFailure => "typecheck_failure",
            FailureType::AgentError => "agent_error",
            FailureType::Timeout => "timeout",
        }
    }

    /// Failures that imply the agent wrote code worth reverting.
    pub fn touches_code(self) -> bool {
        matches!(
            self,
            FailureType::TestFailure | FailureType::TypecheckFailure
        )
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure observed in one iteration.
///
/// `retry_count` is zero when produced by the classifier and stamped by the
/// failure tracker when recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub failure_type: FailureType,
    pub message: String,
    pub output: String,
    pub unit_id: UnitId,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// Recovery strategy applied to a detected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategyKind {
    Retry,
    Skip,
    Rollback,
}

impl RecoveryStrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategyKind::Retry => "retry",
            RecoveryStrategyKind::Skip => "skip",
            RecoveryStrategyKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for RecoveryStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(RecoveryStrategyKind::Retry),
            "skip" => Ok(RecoveryStrategyKind::Skip),
            "rollback" => Ok(RecoveryStrategyKind::Rollback),
            other => Err(anyhow!(
                "unknown recovery strategy '{other}' (expected retry|skip|rollback)"
            )),
        }
    }
}

/// Outcome of applying a recovery strategy.
///
/// `should_retry` and `should_skip` are never both set. Both are false only
/// for the success path where no action is needed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecoveryResult {
    pub success: bool,
    pub message: String,
    pub should_retry: bool,
    pub should_skip: bool,
    /// Guidance to inject into the next agent prompt for the same unit.
    pub modified_prompt: Option<String>,
}

impl RecoveryResult {
    pub fn no_failure() -> Self {
        Self {
            success: true,
            message: "no failure detected".to_string(),
            ..Self::default()
        }
    }
}

/// Estimated size of a unit, derived from its step count and description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn bump(self) -> Self {
        match self {
            Complexity::Low => Complexity::Medium,
            Complexity::Medium | Complexity::High => Complexity::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// Why a unit was set aside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    IterationLimit,
    Deadline,
    Complexity,
    Manual,
}

impl DeferReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferReason::IterationLimit => "iteration_limit",
            DeferReason::Deadline => "deadline",
            DeferReason::Complexity => "complexity",
            DeferReason::Manual => "manual",
        }
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named condition that causes replanning to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanTrigger {
    TestFailure,
    RequirementChange,
    BlockedFeature,
    Manual,
}

impl ReplanTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplanTrigger::TestFailure => "test_failure",
            ReplanTrigger::RequirementChange => "requirement_change",
            ReplanTrigger::BlockedFeature => "blocked_feature",
            ReplanTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for ReplanTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the plan is restructured once a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplanStrategy {
    Incremental,
    Agent,
    None,
}

impl ReplanStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplanStrategy::Incremental => "incremental",
            ReplanStrategy::Agent => "agent",
            ReplanStrategy::None => "none",
        }
    }
}

impl fmt::Display for ReplanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplanStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(ReplanStrategy::Incremental),
            "agent" => Ok(ReplanStrategy::Agent),
            "none" => Ok(ReplanStrategy::None),
            other => Err(anyhow!(
                "unknown replan strategy '{other}' (expected incremental|agent|none)"
            )),
        }
    }
}
