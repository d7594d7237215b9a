//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod changes;
pub mod contract;
pub mod json_extract;
pub mod persona;
pub mod retry;
pub mod routing;
pub mod state;
pub mod types;
