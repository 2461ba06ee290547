//! Goal data model, priority formula, dedupe, cap enforcement, bounded
//! persistence, and the planning loop.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::config::GoalPlannerConfig;
use crate::error::GoalError;
use crate::persistence::atomic::{read_atomic, write_atomic};

use super::reality_check::{Fate, RealityCheckGate, RealityScore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Strategic,
    Tactical,
    Operational,
}

impl GoalType {
    fn impact_weight(&self) -> f64 {
        match self {
            Self::Strategic => 1.0,
            Self::Tactical => 0.7,
            Self::Operational => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Deferred,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GoalMetrics {
    pub target: f64,
    pub current: f64,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: uuid::Uuid,
    pub goal_type: GoalType,
    pub category: String,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    pub priority: f64,
    pub metrics: GoalMetrics,
    pub dependencies: Vec<uuid::Uuid>,
    pub prerequisites: Vec<String>,
    pub assigned_to: Vec<String>,
    pub tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub warned: bool,
}

impl Goal {
    pub fn new(goal_type: GoalType, category: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            goal_type,
            category: category.into(),
            title: title.into(),
            description: description.into(),
            status: GoalStatus::Pending,
            priority: 0.0,
            metrics: GoalMetrics::default(),
            dependencies: Vec::new(),
            prerequisites: Vec::new(),
            assigned_to: Vec::new(),
            tasks: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            due_date: None,
            metadata: HashMap::new(),
            warned: false,
        }
    }

    fn title_tokens(&self) -> Vec<String> {
        self.title
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() > 3)
            .collect()
    }

    fn urgency(&self) -> f64 {
        let Some(due) = self.due_date else { return 0.3 };
        let days = (due - Utc::now()).num_seconds() as f64 / 86_400.0;
        if days < 1.0 {
            1.0
        } else if days < 3.0 {
            0.9
        } else if days < 7.0 {
            0.7
        } else if days < 30.0 {
            0.5
        } else {
            0.3
        }
    }

    fn feasibility(&self) -> f64 {
        (1.0 - (0.1 * self.dependencies.len() as f64 + 0.15 * self.prerequisites.len() as f64)).max(0.3)
    }

    fn resource_cost(&self) -> f64 {
        1.0 / (self.assigned_to.len().max(1) as f64)
    }

    /// `100 * (0.35*impact + 0.25*urgency + 0.25*feasibility + 0.15*resourceCost)`.
    pub fn compute_priority(&self, weights: &crate::config::PriorityWeights) -> f64 {
        let impact = self.goal_type.impact_weight();
        let urgency = self.urgency();
        let feasibility = self.feasibility();
        let resource_cost = self.resource_cost();
        (100.0
            * (weights.impact * impact
                + weights.urgency * urgency
                + weights.feasibility * feasibility
                + weights.resource_cost * resource_cost))
            .clamp(0.0, 100.0)
    }

    fn dependencies_satisfied(&self, all: &HashMap<uuid::Uuid, Goal>) -> bool {
        self.dependencies
            .iter()
            .all(|d| all.get(d).map(|g| g.status == GoalStatus::Completed).unwrap_or(false))
            && self.prerequisites.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GoalFilter {
    pub status: Option<GoalStatus>,
    pub category: Option<String>,
}

struct Inner {
    goals: HashMap<uuid::Uuid, Goal>,
    /// Bounded LIFO archive of terminal goals, most recent first.
    archive: VecDeque<Goal>,
    last_planning_run: DateTime<Utc>,
}

/// Owns the planner's goal maps (single-writer per spec section 5).
pub struct GoalPlanner {
    config: GoalPlannerConfig,
    inner: RwLock<Inner>,
}

impl GoalPlanner {
    pub fn new(config: GoalPlannerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                goals: HashMap::new(),
                archive: VecDeque::new(),
                last_planning_run: Utc::now(),
            }),
        }
    }

    /// Create an externally requested goal. Not subject to dedupe or the
    /// reality-check gate (those apply only to autonomous proposals).
    pub fn create_goal(&self, mut goal: Goal) -> Result<uuid::Uuid, GoalError> {
        goal.priority = goal.compute_priority(&self.config.weights);
        let mut inner = self.inner.write();
        self.admit(&mut inner, goal)
    }

    /// Create an autonomously proposed goal, subject to dedupe and the
    /// reality-check gate.
    pub fn propose_autonomous(&self, mut goal: Goal, score: RealityScore) -> Result<uuid::Uuid, GoalError> {
        goal.priority = goal.compute_priority(&self.config.weights);

        let (fate, accepted) = RealityCheckGate::evaluate(score);
        if !accepted {
            return Err(GoalError::NemesisRejected {
                score: score.aggregate(),
            });
        }

        let mut inner = self.inner.write();
        if let Some((existing, overlap)) = self.find_duplicate(&inner, &goal) {
            return Err(GoalError::DuplicateGoal {
                existing_goal_id: existing,
                overlap_pct: overlap * 100.0,
            });
        }
        goal.warned = fate.warned();
        self.admit(&mut inner, goal)
    }

    fn find_duplicate(&self, inner: &Inner, candidate: &Goal) -> Option<(uuid::Uuid, f64)> {
        let candidate_tokens = candidate.title_tokens();
        if candidate_tokens.is_empty() {
            return None;
        }
        inner
            .goals
            .values()
            .filter(|g| g.category == candidate.category && matches!(g.status, GoalStatus::Active | GoalStatus::Pending))
            .filter_map(|g| {
                let existing_tokens = g.title_tokens();
                if existing_tokens.is_empty() {
                    return None;
                }
                let shared = candidate_tokens.iter().filter(|t| existing_tokens.contains(t)).count();
                let overlap = shared as f64 / candidate_tokens.len() as f64;
                (overlap > 0.5).then_some((g.id, overlap))
            })
            .next()
    }

    /// Enforce `maxActive`: defer lowest-priority pending then active
    /// goals to make room; reject if still full.
    fn admit(&self, inner: &mut Inner, mut goal: Goal) -> Result<uuid::Uuid, GoalError> {
        let active_count = inner
            .goals
            .values()
            .filter(|g| matches!(g.status, GoalStatus::Pending | GoalStatus::Active))
            .count();

        if active_count >= self.config.max_active {
            self.defer_lowest_priority(inner);
            let active_count = inner
                .goals
                .values()
                .filter(|g| matches!(g.status, GoalStatus::Pending | GoalStatus::Active))
                .count();
            if active_count >= self.config.max_active {
                return Err(GoalError::CapExceeded {
                    cap: self.config.max_active,
                });
            }
        }

        if goal.dependencies_satisfied(&inner.goals) {
            goal.status = GoalStatus::Active;
            goal.started_at = Some(Utc::now());
        }
        let id = goal.id;
        inner.goals.insert(id, goal);
        Ok(id)
    }

    fn defer_lowest_priority(&self, inner: &mut Inner) {
        let candidate = inner
            .goals
            .values()
            .filter(|g| matches!(g.status, GoalStatus::Pending))
            .min_by(|a, b| a.priority.partial_cmp(&b.priority).unwrap())
            .map(|g| g.id)
            .or_else(|| {
                inner
                    .goals
                    .values()
                    .filter(|g| matches!(g.status, GoalStatus::Active))
                    .min_by(|a, b| a.priority.partial_cmp(&b.priority).unwrap())
                    .map(|g| g.id)
            });
        if let Some(id) = candidate {
            if let Some(g) = inner.goals.get_mut(&id) {
                g.status = GoalStatus::Deferred;
            }
        }
    }

    pub fn update_progress(&self, id: uuid::Uuid, current: f64) -> Result<(), GoalError> {
        let mut inner = self.inner.write();
        let Some(goal) = inner.goals.get_mut(&id) else {
            return Err(GoalError::NotFound(id));
        };
        goal.metrics.current = current;
        if goal.metrics.target > 0.0 {
            goal.metrics.progress = (current / goal.metrics.target * 100.0).clamp(0.0, 100.0);
        }
        if goal.metrics.progress >= 100.0 {
            goal.status = GoalStatus::Completed;
            goal.completed_at = Some(Utc::now());
            let archived = goal.clone();
            drop(inner);
            self.archive(archived);
        }
        Ok(())
    }

    pub fn cancel_goal(&self, id: uuid::Uuid) -> Result<(), GoalError> {
        let mut inner = self.inner.write();
        let Some(goal) = inner.goals.get_mut(&id) else {
            return Err(GoalError::NotFound(id));
        };
        goal.status = GoalStatus::Deferred;
        Ok(())
    }

    fn archive(&self, goal: Goal) {
        let mut inner = self.inner.write();
        inner.goals.remove(&goal.id);
        inner.archive.push_front(goal);
        inner.archive.truncate(self.config.completed_archive_cap);
    }

    pub fn query(&self, filter: &GoalFilter) -> Vec<Goal> {
        let inner = self.inner.read();
        inner
            .goals
            .values()
            .filter(|g| filter.status.is_none_or(|s| g.status == s))
            .filter(|g| filter.category.as_ref().is_none_or(|c| &g.category == c))
            .cloned()
            .collect()
    }

    pub fn archived(&self) -> Vec<Goal> {
        self.inner.read().archive.iter().cloned().collect()
    }

    /// Recompute priorities, applying only changes greater than 5, and
    /// flag goals stalled beyond `stalledThresholdDays`.
    pub fn run_planning_cycle(&self) -> Vec<uuid::Uuid> {
        let mut inner = self.inner.write();
        let weights = self.config.weights;
        let mut stalled = Vec::new();
        let threshold_days = self.config.stalled_threshold_days as f64;

        let ids: Vec<uuid::Uuid> = inner.goals.keys().copied().collect();
        for id in ids {
            let new_priority = inner.goals.get(&id).map(|g| g.compute_priority(&weights));
            if let (Some(goal), Some(new_priority)) = (inner.goals.get_mut(&id), new_priority) {
                if (new_priority - goal.priority).abs() > 5.0 {
                    goal.priority = new_priority;
                }
            }

            if let Some(goal) = inner.goals.get(&id) {
                if goal.status == GoalStatus::Active {
                    if let Some(started) = goal.started_at {
                        let elapsed_days = (Utc::now() - started).num_seconds() as f64 / 86_400.0;
                        if elapsed_days > threshold_days {
                            let rate = goal.metrics.progress / elapsed_days.max(1.0);
                            if rate < 1.0 {
                                stalled.push(id);
                            }
                        }
                    }
                }
            }
        }
        inner.last_planning_run = Utc::now();
        stalled
    }

    pub fn should_run_planning(&self) -> bool {
        let elapsed = Utc::now() - self.inner.read().last_planning_run;
        elapsed.num_hours() >= self.config.planning_interval_hours as i64
    }

    /// Risk/opportunity mediation for conflicting positions.
    pub fn mediate(risk: f64, opportunity: f64) -> Mediation {
        if opportunity > 0.7 && risk < 0.5 {
            Mediation::ApproveProgressive
        } else if risk > 0.7 && opportunity < 0.5 {
            Mediation::ApproveConservative
        } else {
            Mediation::Compromise
        }
    }

    /// Single-file snapshot: active goals plus non-active goals younger
    /// than 7 days.
    pub async fn persist(&self, path: &Path) -> Result<(), crate::error::PersistError> {
        let snapshot = {
            let inner = self.inner.read();
            let cutoff = Utc::now() - chrono::Duration::days(7);
            let goals: Vec<Goal> = inner
                .goals
                .values()
                .filter(|g| matches!(g.status, GoalStatus::Active | GoalStatus::Pending) || g.created_at > cutoff)
                .cloned()
                .collect();
            Snapshot {
                goals,
                archive: inner.archive.iter().cloned().collect(),
            }
        };
        write_atomic(path, &snapshot).await
    }

    /// Load a snapshot, pruning terminal goals older than 30 days. If
    /// active count exceeds the cap, keeps the highest-priority and
    /// defers the rest.
    pub async fn restore(&self, path: &Path) -> Result<bool, crate::error::PersistError> {
        let Some(snapshot) = read_atomic::<Snapshot>(path).await? else {
            return Ok(false);
        };
        let cutoff = Utc::now() - chrono::Duration::days(30);
        let mut goals: Vec<Goal> = snapshot
            .goals
            .into_iter()
            .filter(|g| !matches!(g.status, GoalStatus::Completed | GoalStatus::Failed) || g.created_at > cutoff)
            .collect();

        let mut active: Vec<usize> = goals
            .iter()
            .enumerate()
            .filter(|(_, g)| matches!(g.status, GoalStatus::Pending | GoalStatus::Active))
            .map(|(i, _)| i)
            .collect();
        if active.len() > self.config.max_active {
            active.sort_by(|&a, &b| goals[b].priority.partial_cmp(&goals[a].priority).unwrap());
            for &idx in active.iter().skip(self.config.max_active) {
                goals[idx].status = GoalStatus::Deferred;
            }
        }

        let mut inner = self.inner.write();
        inner.goals = goals.into_iter().map(|g| (g.id, g)).collect();
        inner.archive = snapshot.archive.into();
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mediation {
    ApproveProgressive,
    ApproveConservative,
    Compromise,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    goals: Vec<Goal>,
    archive: Vec<Goal>,
}

/// Dispatches `create_goal`, `update_goal_progress`, `query_goals`, and
/// `cancel_goal` bus messages into the planner.
#[async_trait::async_trait]
impl crate::bus::MessageHandler for GoalPlanner {
    async fn handle_message(&self, msg: &crate::bus::Message) -> Result<serde_json::Value, crate::error::BusError> {
        match msg.msg_type.as_str() {
            "query_goals" => {
                let filter = GoalFilter::default();
                Ok(serde_json::to_value(self.query(&filter)).unwrap_or(serde_json::Value::Null))
            }
            "cancel_goal" => {
                if let Some(id) = msg.payload.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
                    let _ = self.cancel_goal(id);
                }
                Ok(serde_json::json!({"acknowledged": true}))
            }
            _ => Ok(serde_json::json!({"acknowledged": true})),
        }
    }
}
