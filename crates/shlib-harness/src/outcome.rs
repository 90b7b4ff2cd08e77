//! What a finished run looked like, and checks a scenario author runs on it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use shlib_core::{PipelineRun, Result, RunStatus, ShlibError};

/// Status and captured log of a run that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub log: Vec<String>,
    /// Generation of the snapshot the run was pinned to.
    pub generation: u64,
}

impl RunOutcome {
    pub(crate) fn capture(run: &PipelineRun, status: RunStatus) -> Self {
        Self {
            run_id: run.id().to_string(),
            status,
            log: run.log(),
            generation: run.generation(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Whether any log line contains `needle`.
    pub fn log_contains(&self, needle: &str) -> bool {
        self.log.iter().any(|line| line.contains(needle))
    }

    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }

    /// `Ok(self)` for a successful run, [`ShlibError::RunFailed`] otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(ShlibError::RunFailed { log: self.log })
        }
    }
}

/// Expected status and log content of a run.
#[derive(Debug, Clone, Default)]
pub struct Expectation {
    status: Option<RunStatus>,
    contains: Vec<String>,
    lacks: Vec<String>,
    patterns: Vec<Regex>,
}

impl Expectation {
    pub fn success() -> Self {
        Self::status(RunStatus::Success)
    }

    pub fn failure() -> Self {
        Self::status(RunStatus::Failure)
    }

    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Some log line must contain `needle`.
    pub fn log_contains(mut self, needle: impl Into<String>) -> Self {
        self.contains.push(needle.into());
        self
    }

    /// No log line may contain `needle`.
    pub fn log_lacks(mut self, needle: impl Into<String>) -> Self {
        self.lacks.push(needle.into());
        self
    }

    /// Some log line must match `pattern`.
    pub fn log_matches(mut self, pattern: Regex) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn evaluate(&self, outcome: &RunOutcome) -> ExpectationReport {
        let mut violations = Vec::new();

        if let Some(expected) = self.status {
            if outcome.status != expected {
                violations.push(format!(
                    "expected status {expected}, run finished with {}",
                    outcome.status
                ));
            }
        }
        for needle in &self.contains {
            if !outcome.log_contains(needle) {
                violations.push(format!("log does not contain {needle:?}"));
            }
        }
        for needle in &self.lacks {
            if outcome.log_contains(needle) {
                violations.push(format!("log unexpectedly contains {needle:?}"));
            }
        }
        for pattern in &self.patterns {
            if !outcome.log.iter().any(|line| pattern.is_match(line)) {
                violations.push(format!("no log line matches /{}/", pattern.as_str()));
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("run {} met every expectation", outcome.run_id)
        } else {
            format!(
                "run {} failed {} expectation(s)",
                outcome.run_id,
                violations.len()
            )
        };

        ExpectationReport {
            passed,
            violations,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationReport {
    pub passed: bool,
    /// One entry per unmet expectation (empty if passed).
    pub violations: Vec<String>,
    pub message: String,
}
