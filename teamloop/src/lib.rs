//! Goal-driven plan, design, generate, verify and review pipeline.
//!
//! A one-line goal goes through planning and design, then generation is retried
//! against a verification oracle until it passes or the iteration budget runs out.
//!
//! - **[`core`]**: Pure, deterministic logic (state, routing, the file-set contract,
//!   JSON extraction, change sets, retry policy). No I/O.
//! - **[`io`]**: Side effects (sandbox writes, fingerprints, run log, child processes,
//!   chat backends, configuration).
//! - **[`agents`]**: One module per model-driven stage.
//!
//! [`pipeline`] composes them into the workflow engine used by the CLI.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
