//! loadbench -- resumable benchmark workload runner.
//!
//! This crate provides the run journal, the process-backed load generators
//! and their plugins, the local scheduler, and the live progress parser for
//! remote-execution output.

pub mod config;
pub mod events;
pub mod generator;
pub mod journal;
pub mod logging;
pub mod plugins;
pub mod runner;
