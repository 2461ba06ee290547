//! cognis-runtime - a long-lived multi-agent cognitive runtime.
//!
//! Arbiters are long-lived workers coordinated over a process-wide
//! message bus, supervised with restart policies, and backed by a
//! learning pipeline (experience replay, outcome tracking, strategy
//! selection), an autonomous goal planner, a tiered memory cascade, a
//! content indexer, and a nighttime orchestration pipeline.

pub mod arbiter;
pub mod audit;
pub mod breaker;
pub mod buffers;
pub mod bus;
pub mod config;
pub mod error;
pub mod goals;
pub mod indexer;
pub mod learning;
pub mod memory;
pub mod nighttime;
pub mod persistence;
pub mod rate_limiter;
pub mod signing;
pub mod supervisor;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
