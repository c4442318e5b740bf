//! distcalc — distributed arithmetic expression evaluator.
//!
//! An orchestrator splits submitted expressions into binary tasks and hands
//! them to polling worker agents, then folds their results back together.

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod parser;
pub mod scheduler;
pub mod store;
