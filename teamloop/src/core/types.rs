//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between the engine, the stages, and the
//! run log. They do not touch the filesystem or the network.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A named step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pm,
    Architect,
    Coder,
    Qa,
    Reviewer,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pm => "pm",
            Stage::Architect => "architect",
            Stage::Coder => "coder",
            Stage::Qa => "qa",
            Stage::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal states of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    DoneOk,
    DoneFailed,
}

/// Where control goes after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(Stage),
    Finish(Terminal),
}

/// Recoverable failure family recorded alongside the error text.
///
/// Every kind routes back to generation and consumes one unit of the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ProtocolError,
    ContractViolation,
    MissingRequiredFile,
    VerificationFailure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ProtocolError => "ProtocolError",
            FailureKind::ContractViolation => "ContractViolation",
            FailureKind::MissingRequiredFile => "MissingRequiredFile",
            FailureKind::VerificationFailure => "VerificationFailure",
        }
    }

    /// True for failures raised before anything reached the sandbox.
    pub fn is_generation_failure(self) -> bool {
        !matches!(self, FailureKind::VerificationFailure)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry per stage execution, appended in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub ts: String,
    pub stage: Stage,
    pub message: String,
    pub iteration: u32,
}

impl TraceEntry {
    pub fn now(stage: Stage, message: impl Into<String>, iteration: u32) -> Self {
        Self {
            ts: utc_timestamp(),
            stage,
            message: message.into(),
            iteration,
        }
    }
}

/// Outcome of one verification oracle invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Process exit code; `None` when the oracle was killed (e.g. timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Render the report as the text surfaced to the generation stage.
    pub fn render(&self) -> String {
        let code = match self.exit_code {
            Some(code) => code.to_string(),
            None => "timeout".to_string(),
        };
        format!(
            "returncode={code}\nstdout:\n{}\nstderr:\n{}",
            self.stdout, self.stderr
        )
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
