//! [E] Arbiter identity, lifecycle, and shared guarded operations.

pub mod base;
pub mod types;

pub use base::{ArbiterBase, ArbiterConfig, ArbiterHooks, ContextEntry, HealthStatus};
pub use types::{ArbiterId, ArbiterStatus, Capability, Dna, Role};
