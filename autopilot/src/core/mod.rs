//! Deterministic, pure logic shared by the orchestration layers.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod command;
pub mod translate;
pub mod types;
