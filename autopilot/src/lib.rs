//! Orchestration core for desktop-automation tasks.
//!
//! A task is a natural-language instruction driven through a bounded loop:
//! capture an observation, ask a decision engine for the next action,
//! classify it, and dispatch input commands to a backend.
//!
//! - **[`core`]**: Pure, deterministic logic (task types, command model,
//!   classification, textual translation). No I/O.
//! - **[`io`]**: Side-effecting seams and backends (config, process execution,
//!   dispatch, capture, decision, progress, archive).
//!
//! [`registry`], [`step`] and [`service`] coordinate the two: the registry owns
//! task state, the step executor runs one task, and the service admits tasks
//! and runs them on a background thread.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod profiler;
pub mod registry;
pub mod service;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
