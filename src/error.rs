//! Runtime error taxonomy.
//!
//! Each kind in spec section 7 gets its own variant. Errors are grouped by
//! the component that raises them, mirroring how a production workspace
//! keeps one `thiserror` enum per bounded concern rather than a single
//! grab-bag error type.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by arbiter construction and lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    /// Declarative config schema validation failed; carries every offense.
    #[error("config validation failed: {0:?}")]
    ConfigValidation(Vec<String>),

    /// `onInitialize` hook failed during `initialize()`.
    #[error("arbiter initialization failed: {0}")]
    InitFailed(String),

    /// An externally observable operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A capacity (micro-agents, clones) was reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The circuit breaker guarding this operation is open.
    #[error("circuit open, next attempt at {next_attempt_ms}ms")]
    CircuitOpen { next_attempt_ms: i64 },

    /// Rate limit exceeded for the guarded operation.
    #[error("rate limit exceeded for key '{0}'")]
    RateLimited(String),
}

impl ArbiterError {
    /// Transient errors may succeed if retried later.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CircuitOpen { .. } | Self::RateLimited(_)
        )
    }

    /// Fatal errors end the affected arbiter instance.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigValidation(_) | Self::InitFailed(_))
    }
}

/// Errors raised by the message bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Delivery addressed a peer name that isn't registered.
    #[error("peer unknown: {0}")]
    PeerUnknown(String),

    /// A peer name was already registered.
    #[error("peer already registered: {0}")]
    DuplicatePeer(String),

    /// A correlated request was not answered before its deadline.
    #[error("request to '{to}' timed out after {timeout_ms}ms")]
    Timeout { to: String, timeout_ms: u64 },

    /// The peer's handler returned an error.
    #[error("handler error from '{peer}': {message}")]
    HandlerFailed { peer: String, message: String },
}

/// Errors raised by persistence (snapshot save/load).
///
/// Persistence errors are always non-fatal to the producing operation —
/// they are logged and the in-memory state continues to serve.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("failed to write snapshot at {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("failed to read snapshot at {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("snapshot at {path} exceeded the size cap ({size} > {cap} bytes); quarantined")]
    Oversize { path: String, size: u64, cap: u64 },

    #[error("snapshot at {path} failed to parse and was quarantined: {message}")]
    Corrupted { path: String, message: String },
}

/// Errors raised by the goal planner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GoalError {
    #[error("goal not found: {0}")]
    NotFound(Uuid),

    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("duplicate of existing goal {existing_goal_id} ({overlap_pct:.0}% title overlap)")]
    DuplicateGoal {
        existing_goal_id: Uuid,
        overlap_pct: f64,
    },

    #[error("autonomous goal rejected by reality-check gate: score {score:.2} < 0.5")]
    NemesisRejected { score: f64 },

    #[error("active goal cap ({cap}) reached and no goal could be deferred")]
    CapExceeded { cap: usize },
}

/// Top-level runtime error, used at module boundaries that aggregate the
/// component errors above (e.g. the nighttime orchestrator's task results).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Goal(#[from] GoalError),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
