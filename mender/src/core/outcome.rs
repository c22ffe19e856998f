//! Shared deterministic types for the pass loop.
//!
//! These types define the contracts between the loop and its collaborators.
//! The loop transitions on [`PassOutcome`] alone; free-text feedback rides
//! along for the model but never drives control flow.

use serde::{Deserialize, Serialize};

/// Failure classes the loop retries by carrying feedback into the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    /// The model backend failed (after in-pass backoff was exhausted).
    Backend,
    /// The reply did not follow the response contract.
    Protocol,
    /// A proposed write failed for a reason worth another attempt.
    Write,
    /// The validation pipeline failed.
    Gate,
}

/// Failure classes that end the run immediately for an operator to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalKind {
    /// A proposed path escaped the root or missed the allowlist.
    Sandbox,
    /// A write failed with a permission-class error.
    Write,
}

/// Outcome of one pass, driving the next loop transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Gate green; edits are committed (and shipped when enabled).
    Success { summary: String },
    /// The reply proposed no edits and the deployment accepts that as a
    /// reasoned terminal outcome.
    NoEditsNeeded { summary: String },
    /// Recoverable failure; `feedback` is carried into the next pass.
    Retry { kind: RetryKind, feedback: String },
    /// Unrecoverable failure; the loop stops without another pass.
    Fatal { kind: FatalKind, detail: String },
}

impl PassOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PassOutcome::Retry { .. })
    }
}

/// Captured result of one gate step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStepReport {
    /// The command line as configured, joined for display.
    pub command: String,
    pub success: bool,
    /// Combined stdout/stderr, bounded by the configured output limit.
    pub output: String,
}

/// Ordered record of a gate run. Steps after the first failure never execute
/// and therefore never appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub steps: Vec<GateStepReport>,
}

impl GateReport {
    /// Overall verdict: every executed step succeeded. A report with zero
    /// steps is green (a deployment may configure an empty pipeline).
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    /// The step that failed, if any.
    pub fn failure(&self) -> Option<&GateStepReport> {
        self.steps.iter().find(|s| !s.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(command: &str, success: bool) -> GateStepReport {
        GateStepReport {
            command: command.to_string(),
            success,
            output: String::new(),
        }
    }

    #[test]
    fn empty_gate_report_is_green() {
        assert!(GateReport::default().passed());
        assert!(GateReport::default().failure().is_none());
    }

    #[test]
    fn any_failed_step_fails_the_gate() {
        let report = GateReport {
            steps: vec![step("install", true), step("build", false)],
        };
        assert!(!report.passed());
        assert_eq!(report.failure().expect("failure").command, "build");
    }

    #[test]
    fn retry_outcomes_are_not_terminal() {
        let retry = PassOutcome::Retry {
            kind: RetryKind::Gate,
            feedback: "build failed".to_string(),
        };
        assert!(!retry.is_terminal());
        assert!(PassOutcome::Success {
            summary: String::new()
        }
        .is_terminal());
        assert!(PassOutcome::Fatal {
            kind: FatalKind::Sandbox,
            detail: String::new()
        }
        .is_terminal());
    }
}
