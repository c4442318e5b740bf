//! Worker agent — polls for tasks, computes them and reports results.
//!
//! One agent process runs `COMPUTING_POWER` independent [`Worker`] loops.

pub mod source;
pub mod worker;

pub use source::{HttpTaskSource, LocalTaskSource, TaskSource};
pub use worker::{Backoff, Step, Worker, compute};
