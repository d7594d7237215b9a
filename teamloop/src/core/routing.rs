//! Deterministic edges of the workflow graph.
//!
//! `PM -> ARCHITECT -> CODER -> QA -> {CODER | REVIEWER | DONE_FAILED}`,
//! `REVIEWER -> DONE_OK`.

use crate::core::state::PipelineState;
use crate::core::types::{Stage, Terminal, Transition};

/// Entry point of every run.
pub const INITIAL_STAGE: Stage = Stage::Pm;

/// Return the transition taken after `stage` completed on `state`.
pub fn next_transition(stage: Stage, state: &PipelineState, max_iterations: u32) -> Transition {
    match stage {
        Stage::Pm => Transition::Next(Stage::Architect),
        Stage::Architect => Transition::Next(Stage::Coder),
        Stage::Coder => Transition::Next(Stage::Qa),
        Stage::Qa => route_after_qa(state, max_iterations),
        Stage::Reviewer => Transition::Finish(Terminal::DoneOk),
    }
}

fn route_after_qa(state: &PipelineState, max_iterations: u32) -> Transition {
    if !state.has_error() {
        return Transition::Next(Stage::Reviewer);
    }
    if state.iteration >= max_iterations {
        return Transition::Finish(Terminal::DoneFailed);
    }
    Transition::Next(Stage::Coder)
}
