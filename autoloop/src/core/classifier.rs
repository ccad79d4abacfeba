//! Heuristic classification of agent output into the failure taxonomy.
//!
//! Agent and tool output is free-form text with no structured exit protocol,
//! so classification is an ordered rule table evaluated top to bottom. The
//! order is load-bearing: compiler errors are matched before test failures,
//! and the timeout check runs twice (gated on test context first, then
//! unconditionally).

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use crate::core::types::{Failure, FailureType, UnitId};

const MAX_MESSAGE_CHARS: usize = 200;

static TEST_CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:test\w*|specs?|assert\w*|expect\w*|should|describe|pytest|jest|vitest|mocha|rspec|junit)\b|\bit\(|--- fail|--- pass|=== run|go test|cargo test|npm test",
    )
    .unwrap()
});

static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"timeout|timed out|deadline exceeded|context deadline").unwrap());

static COMPILATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"cannot find (?:module|package)|undefined:|type error|syntax ?error|compilation failed|build failed|cannot compile|could not compile|does not exist|no such file|undeclared name|not declared|import cycle|error\[e\d{4}\]|error ts\d{4}",
    )
    .unwrap()
});

static EXPLICIT_TEST_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"tests? failed|assertion failed|--- fail:|=== fail").unwrap()
});

/// `FAIL <module-path>` as printed by `go test` and jest-style runners.
static FAIL_MODULE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAIL\s+\S*[/.]\S*").unwrap());

static BARE_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFAIL\b").unwrap());

static GENERIC_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"error:|\bfailed\b").unwrap());

/// Precomputed views of one output blob shared by all rules.
struct Signals<'a> {
    raw: &'a str,
    lower: String,
    test_context: bool,
}

impl<'a> Signals<'a> {
    fn new(raw: &'a str) -> Self {
        let lower = raw.to_lowercase();
        let test_context = TEST_CONTEXT_RE.is_match(&lower);
        Self {
            raw,
            lower,
            test_context,
        }
    }
}

struct Rule {
    failure_type: FailureType,
    matches: fn(&Signals<'_>) -> bool,
}

/// Evaluated in order; the first matching rule wins.
const RULES: &[Rule] = &[
    Rule {
        failure_type: FailureType::Timeout,
        matches: timeout_outside_test_output,
    },
    Rule {
        failure_type: FailureType::TypecheckFailure,
        matches: compilation_error,
    },
    Rule {
        failure_type: FailureType::TestFailure,
        matches: test_failure,
    },
    Rule {
        failure_type: FailureType::Timeout,
        matches: any_timeout,
    },
];

fn timeout_outside_test_output(signals: &Signals<'_>) -> bool {
    !signals.test_context && TIMEOUT_RE.is_match(&signals.lower)
}

fn compilation_error(signals: &Signals<'_>) -> bool {
    COMPILATION_RE.is_match(&signals.lower)
}

fn test_failure(signals: &Signals<'_>) -> bool {
    if EXPLICIT_TEST_FAILURE_RE.is_match(&signals.lower)
        || FAIL_MODULE_LINE_RE.is_match(signals.raw)
    {
        return true;
    }
    // Ambiguous tokens only count inside test-runner output.
    signals.test_context
        && (BARE_FAIL_RE.is_match(signals.raw)
            || signals.lower.contains("panic:")
            || GENERIC_ERROR_RE.is_match(&signals.lower))
}

fn any_timeout(signals: &Signals<'_>) -> bool {
    TIMEOUT_RE.is_match(&signals.lower)
}

/// Classify output into a failure type. `FailureType::None` means success.
///
/// A non-zero exit code makes the result at least `AgentError`; the rule
/// table may refine it into a more specific type.
pub fn classify_output(output: &str, exit_code: i32) -> FailureType {
    let signals = Signals::new(output);
    if let Some(rule) = RULES.iter().find(|rule| (rule.matches)(&signals)) {
        return rule.failure_type;
    }
    if exit_code != 0 {
        FailureType::AgentError
    } else {
        FailureType::None
    }
}

/// Classify output and build a [`Failure`] record, or `None` on success.
pub fn classify(output: &str, exit_code: i32, unit_id: UnitId, iteration: u32) -> Option<Failure> {
    let failure_type = classify_output(output, exit_code);
    if failure_type == FailureType::None {
        return None;
    }
    Some(Failure {
        failure_type,
        message: extract_message(output, failure_type, exit_code),
        output: output.to_string(),
        unit_id,
        iteration,
        timestamp: Utc::now(),
        retry_count: 0,
    })
}

/// Pick the first output line mentioning a type-specific keyword.
pub fn extract_message(output: &str, failure_type: FailureType, exit_code: i32) -> String {
    let keywords = message_keywords(failure_type);
    let found = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let lower = line.to_lowercase();
            keywords.iter().any(|keyword| lower.contains(keyword))
        });
    match found {
        Some(line) => truncate_chars(line, MAX_MESSAGE_CHARS),
        None => default_message(failure_type, exit_code),
    }
}

fn message_keywords(failure_type: FailureType) -> &'static [&'static str] {
    match failure_type {
        FailureType::TestFailure => &["fail", "assert", "panic", "expected", "error"],
        FailureType::TypecheckFailure => &[
            "error",
            "cannot",
            "undefined",
            "undeclared",
            "not declared",
            "syntax",
            "does not exist",
            "no such file",
            "import cycle",
        ],
        FailureType::Timeout => &["timeout", "timed out", "deadline"],
        FailureType::AgentError => &["error", "fatal", "failed", "exception"],
        FailureType::None => &[],
    }
}

fn default_message(failure_type: FailureType, exit_code: i32) -> String {
    match failure_type {
        FailureType::TestFailure => "tests failed".to_string(),
        FailureType::TypecheckFailure => "type check or compilation failed".to_string(),
        FailureType::Timeout => "agent timed out".to_string(),
        FailureType::AgentError => format!("agent exited with code {exit_code}"),
        FailureType::None => "no failure".to_string(),
    }
}

fn truncate_chars(line: &str, max: usize) -> String {
    match line.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
