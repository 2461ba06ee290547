//! Learning triad: experience replay, outcome logging, strategy selection.
//!
//! Grounded on `domain/models/memory.rs`'s decay-weighted recency model
//! (for sampling/priority decay) and `domain/ports/task_repository.rs`'s
//! filter/index query shape (for the outcome store).

pub mod experience_store;
pub mod outcome_store;
pub mod strategy_selector;

pub use experience_store::{Experience, ExperienceCategory, ExperienceStore, SampleStrategy, Sampled};
pub use outcome_store::{Outcome, OutcomeFilter, OutcomeStore};
pub use strategy_selector::StrategySelector;
