//! [K] Goal planner: prioritization, dedupe, reality-check gate, bounded
//! persistence and planning loop.
//!
//! Grounded directly on `domain/models/goal.rs`'s scaffolding, extended
//! with the dependency/prerequisite/metrics/tasks fields this spec's
//! goals carry and, unlike the teacher's goals, a terminal
//! `completed`/`failed` status (open question resolved in DESIGN.md).

pub mod planner;
pub mod reality_check;

pub use planner::{Goal, GoalFilter, GoalMetrics, GoalPlanner, GoalStatus, GoalType};
pub use reality_check::{Fate, RealityCheckGate, RealityScore};
