//! I/O adapters: configuration, processes, the validator, the generator, and event sinks.

pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod reporter;
pub mod resolve;
pub mod simulator;
