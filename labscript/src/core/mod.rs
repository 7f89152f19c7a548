//! Deterministic, pure logic shared by the harness and the controller.
//!
//! Core modules must be free of I/O side effects. They operate on captured
//! text and in-memory values and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod code_block;
pub mod feedback;
pub mod patterns;
pub mod truncate;
pub mod types;
