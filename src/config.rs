//! Runtime configuration and declarative validation schema.
//!
//! Mirrors the teacher's `figment`-based hierarchical config loading
//! (defaults -> project yaml -> local yaml -> env), but the validation
//! schema itself is the reusable piece: [`FieldSpec`] is evaluated both
//! against [`RuntimeConfig`] and against each arbiter's own
//! [`crate::arbiter::base::ArbiterConfig`] (spec section 4.E requires
//! config validation to run before any other construction step).

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single field's validation rule, evaluated declaratively rather than
/// through runtime type introspection (spec section 9's "reflection-based
/// config validation collapses to a declarative schema").
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub allowed: Option<&'static [&'static str]>,
    pub validate: Option<fn(&serde_json::Value) -> Result<(), String>>,
}

impl FieldSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            min: None,
            max: None,
            allowed: None,
            validate: None,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub const fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = Some(allowed);
        self
    }

    pub const fn predicate(mut self, f: fn(&serde_json::Value) -> Result<(), String>) -> Self {
        self.validate = Some(f);
        self
    }

    /// Check `value` (absent = `None`) against this spec, appending any
    /// offense to `offenses`.
    pub fn check(&self, value: Option<&serde_json::Value>, offenses: &mut Vec<String>) {
        let Some(value) = value else {
            if self.required {
                offenses.push(format!("{}: required field missing", self.name));
            }
            return;
        };

        if let (Some(min), Some(max)) = (self.min, self.max) {
            if let Some(n) = value.as_f64() {
                if n < min || n > max {
                    offenses.push(format!(
                        "{}: {n} out of range [{min}, {max}]",
                        self.name
                    ));
                }
            }
        }

        if let Some(allowed) = self.allowed {
            if let Some(s) = value.as_str() {
                if !allowed.contains(&s) {
                    offenses.push(format!(
                        "{}: '{s}' not in {allowed:?}",
                        self.name
                    ));
                }
            }
        }

        if let Some(f) = self.validate {
            if let Err(msg) = f(value) {
                offenses.push(format!("{}: {msg}", self.name));
            }
        }
    }
}

/// Evaluate a list of [`FieldSpec`]s against a JSON object, returning every
/// offense found (never just the first). An empty config document paired
/// with no `required` fields validates successfully.
pub fn validate_schema(
    doc: &serde_json::Value,
    fields: &[FieldSpec],
) -> Result<(), Vec<String>> {
    let mut offenses = Vec::new();
    let obj = doc.as_object();
    for field in fields {
        let value = obj.and_then(|o| o.get(field.name));
        field.check(value, &mut offenses);
    }
    if offenses.is_empty() {
        Ok(())
    } else {
        Err(offenses)
    }
}

/// Priority-formula weights for the goal planner (spec section 4.K).
/// Open question resolved: weights are configurable; these are the
/// spec's own suggested defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriorityWeights {
    pub impact: f64,
    pub urgency: f64,
    pub feasibility: f64,
    pub resource_cost: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            impact: 0.35,
            urgency: 0.25,
            feasibility: 0.25,
            resource_cost: 0.15,
        }
    }
}

/// Goal planner tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalPlannerConfig {
    pub max_active: usize,
    pub planning_interval_hours: u64,
    pub stalled_threshold_days: u64,
    pub retention_days: i64,
    pub completed_archive_cap: usize,
    pub weights: PriorityWeights,
}

impl Default for GoalPlannerConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            planning_interval_hours: 6,
            stalled_threshold_days: 3,
            retention_days: 30,
            completed_archive_cap: 200,
            weights: PriorityWeights::default(),
        }
    }
}

/// Strategy selector tunables (UCB1, spec section 4.J).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrategySelectorConfig {
    pub min_trials_before_exploit: u32,
    pub epsilon: f64,
    pub exploration_constant: f64,
    pub reward_window: usize,
    pub decay: f64,
}

impl Default for StrategySelectorConfig {
    fn default() -> Self {
        Self {
            min_trials_before_exploit: 3,
            epsilon: 0.1,
            exploration_constant: 1.4142135623730951,
            reward_window: 50,
            decay: 0.9,
        }
    }
}

/// Memory tier tunables (spec section 4.L).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemoryTiersConfig {
    pub hot_ttl_secs: u64,
    pub cleanup_retention_days: i64,
    pub cleanup_importance_floor: f64,
}

impl Default for MemoryTiersConfig {
    fn default() -> Self {
        Self {
            hot_ttl_secs: 3600,
            cleanup_retention_days: 30,
            cleanup_importance_floor: 0.3,
        }
    }
}

/// Content indexer tunables (spec section 4.M).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IndexerConfig {
    pub worker_concurrency: usize,
    pub dedupe: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            dedupe: true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub state_dir: String,
    pub max_agents: usize,
    pub logging: LogConfig,
    pub goal_planner: GoalPlannerConfig,
    pub strategy_selector: StrategySelectorConfig,
    pub memory_tiers: MemoryTiersConfig,
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: "state".to_string(),
            max_agents: 20,
            logging: LogConfig::default(),
            goal_planner: GoalPlannerConfig::default(),
            strategy_selector: StrategySelectorConfig::default(),
            memory_tiers: MemoryTiersConfig::default(),
            indexer: IndexerConfig::default(),
            extra: HashMap::new(),
        }
    }
}

/// Logging configuration, matching the teacher's `LogConfig` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Hierarchical config loader: defaults -> `cognis.yaml` -> `cognis.local.yaml`
/// -> `COGNIS_`-prefixed env vars (highest precedence).
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the runtime config, validating the result.
    pub fn load() -> anyhow::Result<RuntimeConfig> {
        let config: RuntimeConfig = Figment::new()
            .merge(Serialized::defaults(RuntimeConfig::default()))
            .merge(Yaml::file("cognis.yaml"))
            .merge(Yaml::file("cognis.local.yaml"))
            .merge(Env::prefixed("COGNIS_").split("__"))
            .extract()?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &RuntimeConfig) -> anyhow::Result<()> {
        if config.max_agents == 0 || config.max_agents > 1000 {
            anyhow::bail!("max_agents must be in 1..=1000, got {}", config.max_agents);
        }
        if config.goal_planner.max_active == 0 {
            anyhow::bail!("goal_planner.max_active must be > 0");
        }
        if !(0.0..=1.0).contains(&config.strategy_selector.epsilon) {
            anyhow::bail!("strategy_selector.epsilon must be in [0, 1]");
        }
        if config.memory_tiers.hot_ttl_secs == 0 {
            anyhow::bail!("memory_tiers.hot_ttl_secs must be > 0");
        }
        if config.indexer.worker_concurrency == 0 {
            anyhow::bail!("indexer.worker_concurrency must be > 0");
        }
        Ok(())
    }
}
