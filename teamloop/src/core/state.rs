//! The single mutable record threaded through one pipeline run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{FailureKind, Stage, TraceEntry};

/// Pipeline state for one run.
///
/// Created with only `goal` populated. Stages receive it by `&mut` one at a time;
/// the engine is the only owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub goal: String,
    pub requirements: String,
    pub architecture: String,
    /// Relative path -> content of the last accepted generation. Keys are unique
    /// case-insensitively (enforced by the contract before insertion).
    pub files: BTreeMap<String, String>,
    /// Last error text; empty means "no outstanding error".
    pub error: String,
    pub error_kind: Option<FailureKind>,
    pub verification_report: String,
    pub review_notes: String,
    pub iteration: u32,
    pub trace: Vec<TraceEntry>,
    /// Set once the deterministic verification fault has been injected.
    pub fault_injected: bool,
}

impl PipelineState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Record a recoverable failure.
    pub fn set_failure(&mut self, kind: FailureKind, text: String) {
        self.error = text;
        self.error_kind = Some(kind);
    }

    pub fn clear_error(&mut self) {
        self.error.clear();
        self.error_kind = None;
    }

    /// True when the outstanding error came from generation (nothing was written).
    pub fn has_generation_failure(&self) -> bool {
        self.has_error()
            && self
                .error_kind
                .is_some_and(FailureKind::is_generation_failure)
    }

    pub fn record(&mut self, stage: Stage, message: impl Into<String>) {
        self.trace
            .push(TraceEntry::now(stage, message, self.iteration));
    }

    pub fn last_trace(&self) -> Option<&TraceEntry> {
        self.trace.last()
    }

    /// Borrowed view for the run log: file contents are replaced by the key list.
    pub fn snapshot(&self) -> StateSnapshot<'_> {
        StateSnapshot {
            goal: &self.goal,
            requirements: &self.requirements,
            architecture: &self.architecture,
            files: self.files.keys().map(String::as_str).collect(),
            error: &self.error,
            error_kind: self.error_kind,
            verification_report: &self.verification_report,
            review_notes: &self.review_notes,
            iteration: self.iteration,
            trace: &self.trace,
            fault_injected: self.fault_injected,
        }
    }
}

/// Serializable view of [`PipelineState`] without generated file contents.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot<'a> {
    pub goal: &'a str,
    pub requirements: &'a str,
    pub architecture: &'a str,
    pub files: Vec<&'a str>,
    pub error: &'a str,
    pub error_kind: Option<FailureKind>,
    pub verification_report: &'a str,
    pub review_notes: &'a str,
    pub iteration: u32,
    pub trace: &'a [TraceEntry],
    pub fault_injected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_only_has_goal() {
        let state = PipelineState::new("make X");
        assert_eq!(state.goal, "make X");
        assert!(state.requirements.is_empty());
        assert!(state.files.is_empty());
        assert_eq!(state.iteration, 0);
        assert!(!state.has_error());
    }

    #[test]
    fn snapshot_omits_file_contents() {
        let mut state = PipelineState::new("goal");
        state
            .files
            .insert("main.py".to_string(), "SECRET_CONTENT".to_string());
        let json = serde_json::to_string(&state.snapshot()).expect("serialize");
        assert!(json.contains("\"files\":[\"main.py\"]"));
        assert!(!json.contains("SECRET_CONTENT"));
    }

    #[test]
    fn generation_failure_requires_error_text() {
        let mut state = PipelineState::new("goal");
        state.set_failure(FailureKind::ProtocolError, "ProtocolError: x".to_string());
        assert!(state.has_generation_failure());

        state.set_failure(FailureKind::VerificationFailure, "returncode=1".to_string());
        assert!(!state.has_generation_failure());

        state.clear_error();
        assert!(!state.has_generation_failure());
        assert_eq!(state.error_kind, None);
    }

    #[test]
    fn record_stamps_current_iteration() {
        let mut state = PipelineState::new("goal");
        state.iteration = 2;
        state.record(Stage::Qa, "checked");
        let entry = state.last_trace().expect("entry");
        assert_eq!(entry.stage, Stage::Qa);
        assert_eq!(entry.iteration, 2);
        assert_eq!(entry.message, "checked");
    }
}
