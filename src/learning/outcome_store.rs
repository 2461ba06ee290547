//! [I] Outcome store — append-only log with agent/action/time indices.
//!
//! Grounded on `domain/ports/task_repository.rs`'s filter-combination
//! query shape: queries apply the smallest selective index first, then
//! a predicate over the remaining candidates.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::Path;

use crate::error::PersistError;
use crate::persistence::atomic::{read_atomic, write_atomic};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: uuid::Uuid,
    pub agent: String,
    pub action: String,
    pub context: Value,
    pub result: Value,
    pub reward: f64,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// A combination of filters applied together (AND semantics).
#[derive(Debug, Clone, Default)]
pub struct OutcomeFilter {
    pub agent: Option<String>,
    pub action: Option<String>,
    pub success: Option<bool>,
    pub reward_range: Option<Range<f64>>,
    pub time_range: Option<Range<DateTime<Utc>>>,
}

struct Inner {
    log: Vec<Outcome>,
    by_agent: HashMap<String, HashSet<usize>>,
    by_action: HashMap<String, HashSet<usize>>,
    /// Indices into `log`, kept in timestamp order (append order == time
    /// order for a single writer; the store owns the global sequence).
    by_time: Vec<usize>,
}

/// Append-only outcome log with O(1)-per-entry index maintenance.
pub struct OutcomeStore {
    inner: RwLock<Inner>,
    cap: usize,
}

impl OutcomeStore {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                log: Vec::new(),
                by_agent: HashMap::new(),
                by_action: HashMap::new(),
                by_time: Vec::new(),
            }),
            cap,
        }
    }

    pub fn record(&self, outcome: Outcome) {
        let mut inner = self.inner.write();
        let idx = inner.log.len();
        inner.by_agent.entry(outcome.agent.clone()).or_default().insert(idx);
        inner.by_action.entry(outcome.action.clone()).or_default().insert(idx);
        inner.by_time.push(idx);
        inner.log.push(outcome);

        if inner.by_time.len() > self.cap {
            self.evict_oldest(&mut inner);
        }
        if inner.log.len() > 2 * self.cap.max(1) {
            self.compact(&mut inner);
        }
    }

    /// Drop tombstoned entries and renumber indices. Runs only once the
    /// log has grown to twice capacity, keeping eviction itself O(1).
    fn compact(&self, inner: &mut Inner) {
        let live: Vec<Outcome> = inner
            .by_time
            .iter()
            .filter_map(|&i| inner.log.get(i))
            .cloned()
            .collect();
        let mut by_agent: HashMap<String, HashSet<usize>> = HashMap::new();
        let mut by_action: HashMap<String, HashSet<usize>> = HashMap::new();
        let mut by_time = Vec::with_capacity(live.len());
        for (idx, outcome) in live.iter().enumerate() {
            by_agent.entry(outcome.agent.clone()).or_default().insert(idx);
            by_action.entry(outcome.action.clone()).or_default().insert(idx);
            by_time.push(idx);
        }
        inner.log = live;
        inner.by_agent = by_agent;
        inner.by_action = by_action;
        inner.by_time = by_time;
    }

    fn evict_oldest(&self, inner: &mut Inner) {
        let oldest_idx = inner.by_time.remove(0);
        if let Some(outcome) = inner.log.get(oldest_idx).cloned() {
            if let Some(set) = inner.by_agent.get_mut(&outcome.agent) {
                set.remove(&oldest_idx);
            }
            if let Some(set) = inner.by_action.get_mut(&outcome.action) {
                set.remove(&oldest_idx);
            }
        }
        // Tombstone rather than shift every index; queries skip tombstones.
        inner.log[oldest_idx].agent.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `filter`, using the smallest available index as the seed
    /// candidate set before applying remaining predicates.
    pub fn query(&self, filter: &OutcomeFilter) -> Vec<Outcome> {
        let inner = self.inner.read();

        let mut candidates: Option<HashSet<usize>> = None;
        let narrow = |current: Option<HashSet<usize>>, set: &HashSet<usize>| -> HashSet<usize> {
            match current {
                Some(c) => c.intersection(set).copied().collect(),
                None => set.clone(),
            }
        };

        if let Some(agent) = &filter.agent {
            let set = inner.by_agent.get(agent).cloned().unwrap_or_default();
            candidates = Some(narrow(candidates, &set));
        }
        if let Some(action) = &filter.action {
            let set = inner.by_action.get(action).cloned().unwrap_or_default();
            candidates = Some(narrow(candidates, &set));
        }

        let indices: Vec<usize> = match candidates {
            Some(set) => set.into_iter().collect(),
            None => inner.by_time.clone(),
        };

        indices
            .into_iter()
            .filter_map(|i| inner.log.get(i))
            .filter(|o| !o.agent.is_empty() || filter.agent.is_none())
            .filter(|o| filter.success.is_none_or(|s| o.success == s))
            .filter(|o| {
                filter
                    .reward_range
                    .as_ref()
                    .is_none_or(|r| r.contains(&o.reward))
            })
            .filter(|o| {
                filter
                    .time_range
                    .as_ref()
                    .is_none_or(|r| r.start <= o.timestamp && o.timestamp < r.end)
            })
            .cloned()
            .collect()
    }

    /// All outcomes in append (timestamp) order.
    pub fn all(&self) -> Vec<Outcome> {
        self.query(&OutcomeFilter::default())
    }

    pub async fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let live: Vec<Outcome> = {
            let inner = self.inner.read();
            inner
                .by_time
                .iter()
                .filter_map(|&i| inner.log.get(i))
                .filter(|o| !o.agent.is_empty())
                .cloned()
                .collect()
        };
        write_atomic(path, &live).await
    }

    pub async fn restore(&self, path: &Path) -> Result<bool, PersistError> {
        let Some(outcomes) = read_atomic::<Vec<Outcome>>(path).await? else {
            return Ok(false);
        };
        let mut inner = self.inner.write();
        *inner = Inner {
            log: Vec::new(),
            by_agent: HashMap::new(),
            by_action: HashMap::new(),
            by_time: Vec::new(),
        };
        drop(inner);
        for outcome in outcomes {
            self.record(outcome);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(agent: &str, action: &str, reward: f64, success: bool) -> Outcome {
        Outcome {
            id: uuid::Uuid::new_v4(),
            agent: agent.to_string(),
            action: action.to_string(),
            context: Value::Null,
            result: Value::Null,
            reward,
            success,
            duration_ms: Some(10),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn query_by_agent_and_action_combines_as_intersection() {
        let store = OutcomeStore::new(100);
        store.record(outcome("a1", "act1", 1.0, true));
        store.record(outcome("a1", "act2", 1.0, true));
        store.record(outcome("a2", "act1", 1.0, true));

        let result = store.query(&OutcomeFilter {
            agent: Some("a1".to_string()),
            action: Some("act1".to_string()),
            ..Default::default()
        });
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].agent, "a1");
        assert_eq!(result[0].action, "act1");
    }

    #[test]
    fn query_filters_by_success_and_reward_range() {
        let store = OutcomeStore::new(100);
        store.record(outcome("a", "x", 0.5, true));
        store.record(outcome("a", "x", -1.0, false));

        let result = store.query(&OutcomeFilter {
            success: Some(true),
            reward_range: Some(0.0..1.0),
            ..Default::default()
        });
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn eviction_maintains_index_consistency() {
        let store = OutcomeStore::new(3);
        for i in 0..5 {
            store.record(outcome("a", &format!("act{i}"), 1.0, true));
        }
        assert_eq!(store.len(), 3);
        let result = store.query(&OutcomeFilter {
            agent: Some("a".to_string()),
            ..Default::default()
        });
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.json");
        let store = OutcomeStore::new(100);
        store.record(outcome("a", "x", 1.0, true));
        store.persist(&path).await.unwrap();

        let restored = OutcomeStore::new(100);
        assert!(restored.restore(&path).await.unwrap());
        assert_eq!(restored.len(), 1);
    }
}
