//! Self-correcting generation of lab-automation protocol scripts.
//!
//! A natural-language goal is turned into a candidate script, validated with an
//! external simulator, and retried with the simulator's errors fed back into
//! the prompt until the script passes or the attempt budget runs out. The crate
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, feedback
//!   extraction, truncation, shared types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (configuration, child processes, the
//!   validator, the generator command, event sinks).
//!
//! [`controller`] drives the attempt loop over the [`io::generator::Generator`]
//! and [`io::simulator::Simulator`] seams.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
