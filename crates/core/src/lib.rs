//! Core library for the mango task runner
//!
//! This crate contains the container lifecycle orchestration behind the `mango`
//! CLI: admission control, the container runtime client, port handling, health
//! polling, guest setup, configuration, logging, and error handling.

pub mod admission;
pub mod config;
pub mod errors;
pub mod executor;
pub mod guest;
pub mod health;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod progress;
pub mod retry;
pub mod runtime;
pub mod task;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
