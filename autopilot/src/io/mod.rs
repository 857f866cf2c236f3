//! I/O seams and backends for the task loop.

pub mod archive;
pub mod capture;
pub mod config;
pub mod decision;
pub mod dispatcher;
pub mod process;
pub mod progress;
