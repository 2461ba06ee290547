//! Closed-set identity and classification types for arbiters.
//!
//! String-tagged enums are rejected at the boundary rather than accepted
//! permissively: `parse_str` returns `None` for anything outside the
//! closed set, mirroring the teacher's `AgentTier`/`AgentStatus` idiom in
//! `domain/models/agent.rs`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The functional role an arbiter was constructed to perform. Constant
/// for the arbiter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Researcher,
    Executor,
    Critic,
    Coordinator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Researcher => "researcher",
            Self::Executor => "executor",
            Self::Critic => "critic",
            Self::Coordinator => "coordinator",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "researcher" => Some(Self::Researcher),
            "executor" => Some(Self::Executor),
            "critic" => Some(Self::Critic),
            "coordinator" => Some(Self::Coordinator),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single capability an arbiter is permitted to exercise. Capabilities
/// are fixed at construction and never change for the arbiter's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Memorize,
    Recall,
    Plan,
    Execute,
    Critique,
    Coordinate,
    SpawnMicroAgents,
    Clone,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memorize => "memorize",
            Self::Recall => "recall",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Critique => "critique",
            Self::Coordinate => "coordinate",
            Self::SpawnMicroAgents => "spawn_micro_agents",
            Self::Clone => "clone",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memorize" => Some(Self::Memorize),
            "recall" => Some(Self::Recall),
            "plan" => Some(Self::Plan),
            "execute" => Some(Self::Execute),
            "critique" => Some(Self::Critique),
            "coordinate" => Some(Self::Coordinate),
            "spawn_micro_agents" => Some(Self::SpawnMicroAgents),
            "clone" => Some(Self::Clone),
            _ => None,
        }
    }
}

/// Runtime lifecycle status. Transitions form a DAG except for the
/// bidirectional `Active <-> ShuttingDown` edge (a shutdown may be
/// aborted by an incoming clone/spawn request arriving mid-drain, in
/// which case the arbiter resumes `Active`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterStatus {
    Idle,
    Initializing,
    Active,
    ShuttingDown,
    Offline,
    Error,
}

impl ArbiterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::ShuttingDown => "shutting_down",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// Whether `self -> to` is a permitted transition.
    pub fn can_transition_to(&self, to: ArbiterStatus) -> bool {
        use ArbiterStatus::*;
        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, Active)
                | (Initializing, Error)
                | (Active, ShuttingDown)
                | (ShuttingDown, Active)
                | (ShuttingDown, Offline)
                | (Active, Error)
                | (_, Offline)
        )
    }
}

/// 32-byte identity tag, stable for the arbiter's process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dna(pub [u8; 32]);

impl Dna {
    /// Derive a deterministic tag from name and generation, so clones are
    /// distinguishable but reproducible in tests.
    pub fn derive(name: &str, generation: u32) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(generation.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

/// An arbiter's unique identity within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArbiterId(pub String);

impl fmt::Display for ArbiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArbiterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArbiterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
