//! [H] Experience store — capped buffer with uniform/prioritized/
//! stratified/temporal sampling.
//!
//! Grounded on `domain/models/memory.rs`'s decay-weighted recency
//! scoring (reused here for temporal sampling) and the teacher's
//! `push_hint_bounded` batch-evict idiom, generalized to whole-buffer
//! eviction in batches of 10% rather than one at a time, so indices are
//! rebuilt in amortized O(1) per insert rather than every insert.

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::PersistError;
use crate::persistence::atomic::{read_atomic, write_atomic};

const MIN_PRIORITY: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceCategory {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: Value,
    pub action: String,
    pub agent: String,
    pub outcome: String,
    pub reward: f64,
    pub next_state: Option<Value>,
    pub terminal: Option<bool>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub category: ExperienceCategory,
}

impl Experience {
    /// Clamps `reward` into `[-2, 2]` per the invariant.
    pub fn clamp_reward(&mut self) {
        self.reward = self.reward.clamp(-2.0, 2.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStrategy {
    Uniform,
    Prioritized,
    Stratified,
    Temporal,
}

/// Result of a sampling call: parallel indices/experiences/weights.
#[derive(Debug, Clone)]
pub struct Sampled {
    pub indices: Vec<usize>,
    pub experiences: Vec<Experience>,
    pub weights: Vec<f64>,
}

/// Tunables for prioritized sampling and temporal decay.
#[derive(Debug, Clone, Copy)]
pub struct SampleOpts {
    pub alpha: f64,
    pub beta: f64,
    pub decay: f64,
}

impl Default for SampleOpts {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.4,
            decay: 0.9,
        }
    }
}

/// A minimal array-backed sum tree over `priority^alpha`, rebuilt lazily.
struct SumTree {
    tree: Vec<f64>,
    capacity: usize,
}

impl SumTree {
    fn build(values: &[f64]) -> Self {
        let capacity = values.len().max(1).next_power_of_two();
        let mut tree = vec![0.0; 2 * capacity];
        for (i, v) in values.iter().enumerate() {
            tree[capacity + i] = *v;
        }
        for i in (1..capacity).rev() {
            tree[i] = tree[2 * i] + tree[2 * i + 1];
        }
        Self { tree, capacity }
    }

    fn total(&self) -> f64 {
        if self.tree.is_empty() {
            0.0
        } else {
            self.tree[1]
        }
    }

    /// Find the leaf index whose cumulative prefix sum first exceeds `v`.
    fn find(&self, mut v: f64) -> usize {
        let mut idx = 1;
        while idx < self.capacity {
            let left = 2 * idx;
            if v <= self.tree[left] {
                idx = left;
            } else {
                v -= self.tree[left];
                idx = left + 1;
            }
        }
        idx - self.capacity
    }
}

struct Inner {
    buffer: Vec<Experience>,
    priorities: Vec<f64>,
    sum_tree: Option<SumTree>,
    reward_stats: crate::buffers::RollingStats,
}

/// Capped experience buffer. Eviction removes the oldest 10% in a batch
/// once full, amortizing the index rebuild cost.
pub struct ExperienceStore {
    capacity: usize,
    opts: SampleOpts,
    inner: RwLock<Inner>,
}

impl ExperienceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            opts: SampleOpts::default(),
            inner: RwLock::new(Inner {
                buffer: Vec::with_capacity(capacity),
                priorities: Vec::with_capacity(capacity),
                sum_tree: None,
                reward_stats: crate::buffers::RollingStats::new(capacity.max(1)),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an experience. If at capacity, evicts the oldest `ceil(0.1*cap)`
    /// entries first.
    pub fn add(&self, mut experience: Experience) {
        experience.clamp_reward();
        let mut inner = self.inner.write();

        if inner.buffer.len() >= self.capacity {
            let evict_n = ((self.capacity as f64) * 0.1).ceil() as usize;
            let evict_n = evict_n.max(1).min(inner.buffer.len());
            inner.buffer.drain(0..evict_n);
            inner.priorities.drain(0..evict_n);
        }

        inner.reward_stats.record(experience.reward);
        inner.priorities.push(1.0);
        inner.buffer.push(experience);
        inner.sum_tree = None;
    }

    /// Update the priority at `index`. Invalidates the sum tree.
    pub fn update_priority(&self, index: usize, priority: f64) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.priorities.get_mut(index) {
            *slot = priority.max(MIN_PRIORITY);
            inner.sum_tree = None;
        }
    }

    pub fn avg_reward(&self) -> f64 {
        self.inner.read().reward_stats.avg()
    }

    pub fn sample(&self, k: usize, strategy: SampleStrategy) -> Sampled {
        match strategy {
            SampleStrategy::Uniform => self.sample_uniform(k),
            SampleStrategy::Prioritized => self.sample_prioritized(k),
            SampleStrategy::Stratified => self.sample_stratified(k),
            SampleStrategy::Temporal => self.sample_temporal(k),
        }
    }

    fn collect(&self, indices: Vec<usize>, weights: Vec<f64>) -> Sampled {
        let inner = self.inner.read();
        let experiences = indices.iter().map(|&i| inner.buffer[i].clone()).collect();
        Sampled {
            indices,
            experiences,
            weights,
        }
    }

    fn sample_uniform(&self, k: usize) -> Sampled {
        let len = self.len();
        if len == 0 {
            return Sampled {
                indices: vec![],
                experiences: vec![],
                weights: vec![],
            };
        }
        let mut rng = rand::thread_rng();
        let indices: Vec<usize> = (0..k).map(|_| rng.gen_range(0..len)).collect();
        let weights = vec![1.0; indices.len()];
        self.collect(indices, weights)
    }

    fn sample_prioritized(&self, k: usize) -> Sampled {
        let len = self.len();
        if len == 0 || k == 0 {
            return Sampled {
                indices: vec![],
                experiences: vec![],
                weights: vec![],
            };
        }
        let mut inner = self.inner.write();
        if inner.sum_tree.is_none() {
            let alpha = self.opts.alpha;
            let values: Vec<f64> = inner.priorities.iter().map(|p| p.powf(alpha)).collect();
            inner.sum_tree = Some(SumTree::build(&values));
        }
        let tree = inner.sum_tree.as_ref().unwrap();
        let total = tree.total();
        let n = len as f64;

        let mut rng = rand::thread_rng();
        let segment = total / k as f64;
        let mut indices = Vec::with_capacity(k);
        for i in 0..k {
            let lo = segment * i as f64;
            let hi = segment * (i + 1) as f64;
            let v = if hi > lo { rng.gen_range(lo..hi) } else { lo };
            indices.push(tree.find(v).min(len - 1));
        }

        let probs: Vec<f64> = indices
            .iter()
            .map(|&i| inner.priorities[i].powf(self.opts.alpha) / total.max(1e-12))
            .collect();
        let beta = self.opts.beta;
        let raw_weights: Vec<f64> = probs.iter().map(|p| (n * p.max(1e-12)).powf(-beta)).collect();
        let max_w = raw_weights.iter().cloned().fold(f64::MIN, f64::max).max(1e-12);
        let weights: Vec<f64> = raw_weights.iter().map(|w| w / max_w).collect();

        drop(inner);
        self.collect(indices, weights)
    }

    fn sample_stratified(&self, k: usize) -> Sampled {
        let inner = self.inner.read();
        let mut by_category: HashMap<ExperienceCategory, Vec<usize>> = HashMap::new();
        for (i, exp) in inner.buffer.iter().enumerate() {
            by_category.entry(exp.category).or_default().push(i);
        }
        drop(inner);

        let categories: Vec<_> = by_category.keys().copied().collect();
        if categories.is_empty() {
            return Sampled {
                indices: vec![],
                experiences: vec![],
                weights: vec![],
            };
        }
        let base = k / categories.len();
        let remainder = k % categories.len();
        let mut rng = rand::thread_rng();
        let mut indices = Vec::new();
        for (ci, cat) in categories.iter().enumerate() {
            let pool = &by_category[cat];
            if pool.is_empty() {
                continue;
            }
            let quota = base + if ci < remainder { 1 } else { 0 };
            for _ in 0..quota {
                indices.push(pool[rng.gen_range(0..pool.len())]);
            }
        }
        let weights = vec![1.0; indices.len()];
        self.collect(indices, weights)
    }

    fn sample_temporal(&self, k: usize) -> Sampled {
        let inner = self.inner.read();
        let len = inner.buffer.len();
        if len == 0 {
            drop(inner);
            return Sampled {
                indices: vec![],
                experiences: vec![],
                weights: vec![],
            };
        }
        // age measured in buffer-slots from the newest entry; slot 0 = newest.
        let decay = self.opts.decay;
        let probs: Vec<f64> = (0..len)
            .map(|i| {
                let age = (len - 1 - i) as f64;
                decay.powf(age)
            })
            .collect();
        let total: f64 = probs.iter().sum();
        drop(inner);

        let mut rng = rand::thread_rng();
        let mut indices = Vec::with_capacity(k);
        for _ in 0..k {
            let mut v = rng.gen_range(0.0..total.max(1e-12));
            let mut chosen = len - 1;
            for (i, p) in probs.iter().enumerate() {
                if v < *p {
                    chosen = i;
                    break;
                }
                v -= p;
            }
            indices.push(chosen);
        }
        let weights = vec![1.0; indices.len()];
        self.collect(indices, weights)
    }

    /// Atomically snapshot the buffer, priorities, and stats.
    pub async fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot = {
            let inner = self.inner.read();
            Snapshot {
                buffer: inner.buffer.clone(),
                priorities: inner.priorities.clone(),
            }
        };
        write_atomic(path, &snapshot).await
    }

    /// Restore from a snapshot, trimming to capacity if it holds more.
    pub async fn restore(&self, path: &Path) -> Result<bool, PersistError> {
        let Some(snapshot) = read_atomic::<Snapshot>(path).await? else {
            return Ok(false);
        };
        let mut inner = self.inner.write();
        let mut buffer = snapshot.buffer;
        let mut priorities = snapshot.priorities;
        if buffer.len() > self.capacity {
            let drop_n = buffer.len() - self.capacity;
            buffer.drain(0..drop_n);
            priorities.drain(0..drop_n);
        }
        inner.reward_stats = crate::buffers::RollingStats::new(self.capacity.max(1));
        for exp in &buffer {
            inner.reward_stats.record(exp.reward);
        }
        inner.buffer = buffer;
        inner.priorities = priorities;
        inner.sum_tree = None;
        Ok(true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    buffer: Vec<Experience>,
    priorities: Vec<f64>,
}
