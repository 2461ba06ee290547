//! [E] Arbiter base — the shared lifecycle, guards, and health model every
//! arbiter is built on.
//!
//! Grounded on the teacher's state-machine style in `domain/models/task.rs`
//! / `domain/models/agent.rs` for the status transitions, and on
//! `infrastructure/config/loader.rs`'s `ConfigError` shape for
//! construction-time validation.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audit::{AuditLevel, AuditLog};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::buffers::{RingBuffer, RollingStats};
use crate::bus::{Bus, Message, MessageHandler, PeerMeta};
use crate::config::{validate_schema, FieldSpec};
use crate::error::ArbiterError;
use crate::rate_limiter::RateLimiter;

use super::types::{ArbiterId, ArbiterStatus, Capability, Dna, Role};

/// Declarative construction config for an arbiter. Validated against
/// [`ArbiterConfig::schema`] before any other construction step.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub name: String,
    pub role: Role,
    pub capabilities: Vec<Capability>,
    pub max_micro_agents: usize,
    pub max_clones: usize,
    pub context_capacity: usize,
    pub audit_capacity: usize,
    pub breaker: BreakerConfig,
    pub memorize_rate_limit: (u64, Duration),
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: Role::Executor,
            capabilities: Vec::new(),
            max_micro_agents: 10,
            max_clones: 3,
            context_capacity: 256,
            audit_capacity: 512,
            breaker: BreakerConfig::default(),
            memorize_rate_limit: (20, Duration::from_secs(60)),
        }
    }
}

impl ArbiterConfig {
    fn schema() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name").required(),
            FieldSpec::new("max_micro_agents").range(1.0, 10_000.0),
            FieldSpec::new("max_clones").range(0.0, 1_000.0),
        ]
    }

    /// Validate this config as a declarative document, collecting every
    /// offense rather than failing on the first.
    pub fn validate(&self) -> Result<(), ArbiterError> {
        let doc = serde_json::json!({
            "name": self.name,
            "max_micro_agents": self.max_micro_agents,
            "max_clones": self.max_clones,
        });
        validate_schema(&doc, &Self::schema()).map_err(ArbiterError::ConfigValidation)
    }
}

/// Status of a short-lived micro-agent spawned by an arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroAgentStatus {
    Running,
    Completed,
    Failed,
}

impl MicroAgentStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

struct MicroAgentHandle {
    status: MicroAgentStatus,
    spawned_at: DateTime<Utc>,
}

/// A recalled memory entry. Populated by whatever memory tier backs
/// `recall` (wired in at the runtime layer, not by `ArbiterBase` itself).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContextEntry {
    pub content: String,
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Derived (never stored) health snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthStatus {
    pub degraded: bool,
    pub breaker_open: bool,
    pub p95_memorize_ms: f64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub load: f64,
}

/// Hook implemented by concrete arbiter kinds; called once from
/// `initialize()` after config validation and before status becomes
/// `Active`.
#[async_trait]
pub trait ArbiterHooks: Send + Sync {
    async fn on_initialize(&self) -> Result<(), ArbiterError>;
}

/// Shared machinery every arbiter kind is built on: guarded memorize/recall,
/// micro-agent and clone bookkeeping, derived health, and lifecycle.
pub struct ArbiterBase {
    id: ArbiterId,
    config: ArbiterConfig,
    status: RwLock<ArbiterStatus>,
    generation: u32,
    parent_id: Option<String>,
    dna: Dna,
    created_at: DateTime<Utc>,

    breaker: CircuitBreaker,
    limiter: RateLimiter,
    audit: AuditLog,
    memorize_latency: RwLock<RollingStats>,
    context: RwLock<RingBuffer<ContextEntry>>,
    micro_agents: DashMap<String, MicroAgentHandle>,
    clones: DashMap<String, Arc<ArbiterBase>>,

    error_count: AtomicU64,
    timeout_count: AtomicU64,

    hooks: Arc<dyn ArbiterHooks>,
}

impl ArbiterBase {
    /// Construct a new arbiter. Config validation runs first; failure
    /// short-circuits before any other state is built.
    pub fn new(config: ArbiterConfig, hooks: Arc<dyn ArbiterHooks>) -> Result<Self, ArbiterError> {
        config.validate()?;
        let dna = Dna::derive(&config.name, 0);
        let id = ArbiterId::from(config.name.clone());
        let audit = AuditLog::new(config.audit_capacity, AuditLevel::Info);
        let context = RingBuffer::new(config.context_capacity);
        let breaker = CircuitBreaker::new(config.breaker);
        let limiter = RateLimiter::new();
        let (count, window) = config.memorize_rate_limit;
        limiter.set_limit("memorize", count, window);
        limiter.set_limit("recall", count, window);
        limiter.set_limit("spawn_micro_agent", count, window);
        limiter.set_limit("clone", count, window);

        Ok(Self {
            id,
            generation: 0,
            parent_id: None,
            dna,
            created_at: Utc::now(),
            status: RwLock::new(ArbiterStatus::Idle),
            breaker,
            limiter,
            audit,
            memorize_latency: RwLock::new(RollingStats::new(256)),
            context: RwLock::new(context),
            micro_agents: DashMap::new(),
            clones: DashMap::new(),
            error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            config,
            hooks,
        })
    }

    pub fn id(&self) -> &ArbiterId {
        &self.id
    }

    pub fn status(&self) -> ArbiterStatus {
        *self.status.read()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn dna(&self) -> Dna {
        self.dna
    }

    fn transition(&self, to: ArbiterStatus) -> Result<(), ArbiterError> {
        let mut status = self.status.write();
        if !status.can_transition_to(to) {
            return Err(ArbiterError::InitFailed(format!(
                "illegal transition {} -> {}",
                status.as_str(),
                to.as_str()
            )));
        }
        *status = to;
        Ok(())
    }

    /// `idle -> initializing -> active`. On hook failure, status becomes
    /// `error` and `INIT_FAILED` is raised.
    pub async fn initialize(&self) -> Result<(), ArbiterError> {
        self.transition(ArbiterStatus::Initializing)?;
        match self.hooks.on_initialize().await {
            Ok(()) => {
                self.transition(ArbiterStatus::Active)?;
                self.audit.log(AuditLevel::Info, "arbiter initialized", Default::default());
                Ok(())
            }
            Err(e) => {
                let mut status = self.status.write();
                *status = ArbiterStatus::Error;
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(ArbiterError::InitFailed(e.to_string()))
            }
        }
    }

    /// Race `op` against `ms` milliseconds; expiry raises `TIMEOUT`.
    pub async fn with_timeout<F, T>(&self, op: F, ms: u64, label: &str) -> Result<T, ArbiterError>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(Duration::from_millis(ms), op).await {
            Ok(value) => Ok(value),
            Err(_) => {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
                Err(ArbiterError::Timeout {
                    operation: label.to_string(),
                    timeout_ms: ms,
                })
            }
        }
    }

    /// Guarded by breaker, rate limiter, and a per-op timeout.
    pub async fn memorize(&self, content: impl Into<String>, tags: Vec<String>) -> Result<(), ArbiterError> {
        if !self.limiter.check("memorize") {
            return Err(ArbiterError::RateLimited("memorize".to_string()));
        }
        let content = content.into();
        let started = std::time::Instant::now();

        let result = self
            .with_timeout(
                self.breaker.execute::<_, std::future::Pending<Result<(), ()>>, _, _>(
                    async {
                        self.context.write().add(ContextEntry {
                            content: content.clone(),
                            tags: tags.clone(),
                            recorded_at: Utc::now(),
                        });
                        Ok::<(), ()>(())
                    },
                    None,
                ),
                5_000,
                "memorize",
            )
            .await?;

        self.memorize_latency
            .write()
            .record(started.elapsed().as_secs_f64() * 1000.0);

        result.map_err(|e| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    /// Guarded the same way as `memorize`; returns at most `k` entries.
    pub async fn recall(&self, _query: &str, k: usize) -> Result<Vec<ContextEntry>, ArbiterError> {
        if !self.limiter.check("recall") {
            return Err(ArbiterError::RateLimited("recall".to_string()));
        }
        self.with_timeout(
            async {
                let entries = self.context.read().recent(k);
                Ok(entries)
            },
            5_000,
            "recall",
        )
        .await?
    }

    /// Rate-limited. Reaps terminal micro-agents before failing on cap.
    pub fn spawn_micro_agent(&self, id: impl Into<String>) -> Result<(), ArbiterError> {
        if !self.limiter.check("spawn_micro_agent") {
            return Err(ArbiterError::RateLimited("spawn_micro_agent".to_string()));
        }
        if self.micro_agents.len() >= self.config.max_micro_agents {
            self.micro_agents.retain(|_, h| !h.status.is_terminal());
        }
        if self.micro_agents.len() >= self.config.max_micro_agents {
            return Err(ArbiterError::ResourceExhausted("micro_agent cap reached".to_string()));
        }
        self.micro_agents.insert(
            id.into(),
            MicroAgentHandle {
                status: MicroAgentStatus::Running,
                spawned_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn complete_micro_agent(&self, id: &str, failed: bool) {
        if let Some(mut handle) = self.micro_agents.get_mut(id) {
            handle.status = if failed {
                MicroAgentStatus::Failed
            } else {
                MicroAgentStatus::Completed
            };
        }
    }

    /// Construct a peer with `generation + 1`, capped by `max_clones`.
    pub fn clone_peer(self: &Arc<Self>, hooks: Arc<dyn ArbiterHooks>) -> Result<Arc<ArbiterBase>, ArbiterError> {
        if !self.limiter.check("clone") {
            return Err(ArbiterError::RateLimited("clone".to_string()));
        }
        if self.clones.len() >= self.config.max_clones {
            return Err(ArbiterError::ResourceExhausted("clone cap reached".to_string()));
        }
        let generation = self.generation + 1;
        let clone_name = format!("{}-gen{}-{}", self.config.name, generation, self.clones.len());
        let mut child_config = self.config.clone();
        child_config.name = clone_name.clone();

        let child = ArbiterBase {
            id: ArbiterId::from(clone_name.clone()),
            config: child_config,
            status: RwLock::new(ArbiterStatus::Idle),
            generation,
            parent_id: Some(self.config.name.clone()),
            dna: Dna::derive(&clone_name, generation),
            created_at: Utc::now(),
            breaker: CircuitBreaker::new(self.config.breaker),
            limiter: RateLimiter::new(),
            audit: AuditLog::new(self.config.audit_capacity, AuditLevel::Info),
            memorize_latency: RwLock::new(RollingStats::new(256)),
            context: RwLock::new(RingBuffer::new(self.config.context_capacity)),
            micro_agents: DashMap::new(),
            clones: DashMap::new(),
            error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            hooks,
        };
        let child = Arc::new(child);
        self.clones.insert(clone_name, child.clone());
        Ok(child)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Idempotent. Recursively shuts down clones and signals micro-agents
    /// to stop before going `offline`.
    pub async fn shutdown(&self) {
        if matches!(self.status(), ArbiterStatus::Offline) {
            return;
        }
        let _ = self.transition(ArbiterStatus::ShuttingDown);
        for entry in self.clones.iter() {
            Box::pin(entry.value().shutdown()).await;
        }
        self.micro_agents.clear();
        let mut status = self.status.write();
        *status = ArbiterStatus::Offline;
        self.audit.log(AuditLevel::Info, "arbiter shut down", Default::default());
    }

    /// Health is derived on read, never persisted.
    pub fn health(&self) -> HealthStatus {
        let breaker_open = !matches!(self.breaker.state(), crate::breaker::BreakerState::Closed);
        let p95 = self.memorize_latency.read().p95();
        let errors = self.error_count.load(Ordering::Relaxed);
        let timeouts = self.timeout_count.load(Ordering::Relaxed);

        let agent_ratio = self.micro_agents.len() as f64 / self.config.max_micro_agents.max(1) as f64;
        let ring_ratio = self.context.read().len() as f64 / self.context.read().capacity().max(1) as f64;
        let clone_ratio = self.clones.len() as f64 / self.config.max_clones.max(1) as f64;
        let load = ((agent_ratio + ring_ratio + clone_ratio) / 3.0).clamp(0.0, 1.0);

        let degraded = breaker_open || p95 > 1000.0 || errors > 100 || load > 0.9 || timeouts > 10;

        HealthStatus {
            degraded,
            breaker_open,
            p95_memorize_ms: p95,
            error_count: errors,
            timeout_count: timeouts,
            load,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Dispatches inbound bus messages keyed on `msg.type`; unknown types
/// acknowledge non-fatally rather than error.
#[async_trait]
impl MessageHandler for ArbiterBase {
    async fn handle_message(&self, msg: &Message) -> Result<Value, crate::error::BusError> {
        match msg.msg_type.as_str() {
            "ping" => Ok(serde_json::json!({"pong": true})),
            "health" => Ok(serde_json::to_value(self.health()).unwrap_or(Value::Null)),
            _ => Ok(serde_json::json!({"acknowledged": true})),
        }
    }
}

impl serde::Serialize for HealthStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("HealthStatus", 6)?;
        s.serialize_field("degraded", &self.degraded)?;
        s.serialize_field("breaker_open", &self.breaker_open)?;
        s.serialize_field("p95_memorize_ms", &self.p95_memorize_ms)?;
        s.serialize_field("error_count", &self.error_count)?;
        s.serialize_field("timeout_count", &self.timeout_count)?;
        s.serialize_field("load", &self.load)?;
        s.end()
    }
}

/// Register `arbiter` on `bus` under its own name, advertising its
/// configured capabilities.
pub fn register_on_bus(arbiter: Arc<ArbiterBase>, bus: &Bus) -> Result<(), crate::error::BusError> {
    let meta = PeerMeta {
        capabilities: arbiter.config.capabilities.iter().map(|c| c.as_str().to_string()).collect(),
        role: Some(arbiter.config.role.as_str().to_string()),
    };
    let name = arbiter.config.name.clone();
    bus.register(name, arbiter, meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHooks;

    #[async_trait]
    impl ArbiterHooks for NoopHooks {
        async fn on_initialize(&self) -> Result<(), ArbiterError> {
            Ok(())
        }
    }

    struct FailingHooks;

    #[async_trait]
    impl ArbiterHooks for FailingHooks {
        async fn on_initialize(&self) -> Result<(), ArbiterError> {
            Err(ArbiterError::InitFailed("boom".to_string()))
        }
    }

    fn base_config(name: &str) -> ArbiterConfig {
        ArbiterConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_name_fails_validation_before_any_other_construction() {
        let err = ArbiterBase::new(base_config(""), Arc::new(NoopHooks)).unwrap_err();
        assert!(matches!(err, ArbiterError::ConfigValidation(_)));
    }

    #[tokio::test]
    async fn initialize_transitions_idle_to_active() {
        let arbiter = ArbiterBase::new(base_config("a1"), Arc::new(NoopHooks)).unwrap();
        assert_eq!(arbiter.status(), ArbiterStatus::Idle);
        arbiter.initialize().await.unwrap();
        assert_eq!(arbiter.status(), ArbiterStatus::Active);
    }

    #[tokio::test]
    async fn failing_hook_moves_status_to_error() {
        let arbiter = ArbiterBase::new(base_config("a2"), Arc::new(FailingHooks)).unwrap();
        let err = arbiter.initialize().await.unwrap_err();
        assert!(matches!(err, ArbiterError::InitFailed(_)));
        assert_eq!(arbiter.status(), ArbiterStatus::Error);
    }

    #[tokio::test]
    async fn memorize_then_recall_round_trips_through_context_ring() {
        let arbiter = ArbiterBase::new(base_config("a3"), Arc::new(NoopHooks)).unwrap();
        arbiter.initialize().await.unwrap();
        arbiter.memorize("hello", vec!["greeting".to_string()]).await.unwrap();
        let recalled = arbiter.recall("hello", 5).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].content, "hello");
    }

    #[tokio::test]
    async fn spawn_micro_agent_fails_resource_exhausted_at_cap() {
        let mut config = base_config("a4");
        config.max_micro_agents = 1;
        let arbiter = ArbiterBase::new(config, Arc::new(NoopHooks)).unwrap();
        arbiter.spawn_micro_agent("m1").unwrap();
        let err = arbiter.spawn_micro_agent("m2").unwrap_err();
        assert!(matches!(err, ArbiterError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn spawn_micro_agent_reaps_terminal_agents_before_rejecting() {
        let mut config = base_config("a5");
        config.max_micro_agents = 1;
        let arbiter = ArbiterBase::new(config, Arc::new(NoopHooks)).unwrap();
        arbiter.spawn_micro_agent("m1").unwrap();
        arbiter.complete_micro_agent("m1", false);
        arbiter.spawn_micro_agent("m2").unwrap();
        assert_eq!(arbiter.micro_agents.len(), 1);
    }

    #[tokio::test]
    async fn clone_peer_increments_generation_and_sets_parent_id() {
        let arbiter = Arc::new(ArbiterBase::new(base_config("parent"), Arc::new(NoopHooks)).unwrap());
        let child = arbiter.clone_peer(Arc::new(NoopHooks)).unwrap();
        assert_eq!(child.generation(), 1);
        assert_eq!(child.parent_id(), Some("parent"));
    }

    #[tokio::test]
    async fn clone_peer_fails_resource_exhausted_at_cap() {
        let mut config = base_config("parent2");
        config.max_clones = 1;
        let arbiter = Arc::new(ArbiterBase::new(config, Arc::new(NoopHooks)).unwrap());
        arbiter.clone_peer(Arc::new(NoopHooks)).unwrap();
        let err = arbiter.clone_peer(Arc::new(NoopHooks)).unwrap_err();
        assert!(matches!(err, ArbiterError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_recurses_into_clones() {
        let arbiter = Arc::new(ArbiterBase::new(base_config("parent3"), Arc::new(NoopHooks)).unwrap());
        let child = arbiter.clone_peer(Arc::new(NoopHooks)).unwrap();
        arbiter.shutdown().await;
        assert_eq!(arbiter.status(), ArbiterStatus::Offline);
        assert_eq!(child.status(), ArbiterStatus::Offline);
        arbiter.shutdown().await; // idempotent, no panic
    }

    #[tokio::test]
    async fn health_is_degraded_when_breaker_open() {
        let mut config = base_config("a6");
        config.breaker.failure_threshold = 1;
        let arbiter = ArbiterBase::new(config, Arc::new(NoopHooks)).unwrap();
        let _ = arbiter
            .breaker
            .execute::<_, std::future::Pending<Result<(), ()>>, _, _>(async { Err::<(), ()>(()) }, None)
            .await;
        assert!(arbiter.health().degraded);
    }

    #[tokio::test]
    async fn unknown_message_type_acknowledges_non_fatally() {
        let arbiter = ArbiterBase::new(base_config("a7"), Arc::new(NoopHooks)).unwrap();
        let msg = Message::new("x", "a7", "some_unknown_type", Value::Null);
        let result = arbiter.handle_message(&msg).await.unwrap();
        assert_eq!(result, serde_json::json!({"acknowledged": true}));
    }
}
