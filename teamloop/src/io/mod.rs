//! Side-effecting adapters: filesystem, child processes, and network.

pub mod artifacts;
pub mod chat;
pub mod config;
pub mod fingerprint;
pub mod process;
pub mod run_log;
pub mod verifier;
