//! [J] UCB1 strategy selector with epsilon-greedy exploration and
//! outcome-store warm-start.
//!
//! No direct teacher analog; built in the teacher's idiom (DashMap for
//! shared per-key state, `parking_lot` for the small critical sections)
//! since nothing in the corpus implements a bandit.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;

use crate::buffers::RingBuffer;
use crate::config::StrategySelectorConfig;
use crate::learning::outcome_store::OutcomeStore;

struct ArmState {
    trials: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_reward: Mutex<f64>,
    avg_reward: Mutex<f64>,
    rewards: Mutex<RingBuffer<f64>>,
    last_used: Mutex<DateTime<Utc>>,
}

impl ArmState {
    fn new(window: usize) -> Self {
        Self {
            trials: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_reward: Mutex::new(0.0),
            avg_reward: Mutex::new(0.0),
            rewards: Mutex::new(RingBuffer::new(window.max(1))),
            last_used: Mutex::new(Utc::now()),
        }
    }

    fn trials(&self) -> u64 {
        self.trials.load(Ordering::Relaxed)
    }

    fn record(&self, reward: f64, success: bool, decay: f64) {
        self.trials.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.total_reward.lock() += reward;
        self.rewards.lock().add(reward);
        *self.last_used.lock() = Utc::now();

        // Weighted average favoring the most recent rewards via exponential
        // decay applied to the running average itself.
        let mut avg = self.avg_reward.lock();
        *avg = *avg * decay + reward * (1.0 - decay);
    }
}

/// Per-(domain, strategy) UCB1 bandit state, with epsilon-greedy
/// exploration and a minimum-trials floor before exploitation begins.
pub struct StrategySelector {
    config: StrategySelectorConfig,
    arms: DashMap<(String, String), ArmState>,
}

impl StrategySelector {
    pub fn new(config: StrategySelectorConfig) -> Self {
        Self {
            config,
            arms: DashMap::new(),
        }
    }

    fn arm(&self, domain: &str, strategy: &str) -> dashmap::mapref::one::Ref<'_, (String, String), ArmState> {
        let key = (domain.to_string(), strategy.to_string());
        self.arms
            .entry(key.clone())
            .or_insert_with(|| ArmState::new(self.config.reward_window));
        self.arms.get(&key).unwrap()
    }

    /// Select a strategy for `domain`, restricted to `candidates` if given.
    pub fn select(&self, domain: &str, candidates: Option<&[String]>) -> String {
        let pool: Vec<String> = match candidates {
            Some(c) if !c.is_empty() => c.to_vec(),
            _ => self.known_strategies(domain),
        };
        if pool.is_empty() {
            return "default".to_string();
        }

        for s in &pool {
            self.arm(domain, s);
        }

        let mut rng = rand::thread_rng();

        let under_trialed: Vec<&String> = pool
            .iter()
            .filter(|s| self.arm(domain, s).trials() < self.config.min_trials_before_exploit as u64)
            .collect();
        if !under_trialed.is_empty() {
            return under_trialed[rng.gen_range(0..under_trialed.len())].clone();
        }

        if rng.gen::<f64>() < self.config.epsilon {
            return pool[rng.gen_range(0..pool.len())].clone();
        }

        let total_trials: u64 = pool.iter().map(|s| self.arm(domain, s).trials()).sum();
        let ln_total = (total_trials.max(1) as f64).ln();

        let mut best = pool[0].clone();
        let mut best_score = f64::MIN;
        let mut best_last_used = DateTime::<Utc>::MIN_UTC;
        for s in &pool {
            let arm = self.arm(domain, s);
            let trials = arm.trials().max(1) as f64;
            let avg = *arm.avg_reward.lock();
            let score = avg + self.config.exploration_constant * (ln_total / trials).sqrt();
            let last_used = *arm.last_used.lock();
            if score > best_score || (score == best_score && last_used > best_last_used) {
                best_score = score;
                best = s.clone();
                best_last_used = last_used;
            }
        }
        best
    }

    pub fn record(&self, domain: &str, strategy: &str, reward: f64, success: bool) {
        self.arm(domain, strategy).record(reward, success, self.config.decay);
    }

    fn known_strategies(&self, domain: &str) -> Vec<String> {
        self.arms
            .iter()
            .filter(|e| e.key().0 == domain)
            .map(|e| e.key().1.clone())
            .collect()
    }

    /// Rebuild `(domain, strategy)` stats by replaying recorded outcomes,
    /// reading the strategy used from `metadata.strategyUsed`, falling
    /// back to `context.strategy` then `result.strategy`.
    pub fn warm_start(&self, outcomes: &OutcomeStore) {
        for outcome in outcomes.all() {
            let strategy = outcome
                .metadata
                .get("strategyUsed")
                .and_then(|v| v.as_str())
                .or_else(|| outcome.context.get("strategy").and_then(|v| v.as_str()))
                .or_else(|| outcome.result.get("strategy").and_then(|v| v.as_str()));
            if let Some(strategy) = strategy {
                self.record(&outcome.agent, strategy, outcome.reward, outcome.success);
            }
        }
    }
}
