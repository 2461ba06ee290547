//! [N] Nighttime orchestrator: named cron-scheduled sessions, each a
//! sequential DAG of phases whose vertices are tasks against an arbiter.
//!
//! Grounded on `services/swarm_orchestrator/dag_execution.rs`'s
//! wave-based DAG execution (tasks, `TaskOutcome`, fan-out per wave) and
//! on the supervisor's `backoff`-based retry idiom (`supervisor.rs`),
//! generalized from "restart an arbiter" to "retry a task".

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How a session is triggered. `Cron` carries an opaque descriptor for an
/// external scheduler to evaluate; `Interval` is evaluated locally.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(String),
    Interval(Duration),
}

impl Schedule {
    /// Whether an interval-scheduled session is due, given its last run.
    /// Cron schedules are never locally due; an external trigger calls
    /// `run_session` directly.
    pub fn due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Schedule::Cron(_) => false,
            Schedule::Interval(d) => match last_run {
                None => true,
                Some(last) => now.signed_duration_since(last).to_std().map(|e| e >= *d).unwrap_or(false),
            },
        }
    }
}

/// A single vertex in a session's phase DAG.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub arbiter: String,
    pub task_type: String,
    pub params: Value,
    pub retryable: bool,
    pub max_retries: u32,
}

/// A set of tasks executed concurrently (fan-out); the next phase starts
/// only once every task in this one has resolved (fan-in).
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub name: String,
    pub schedule: Schedule,
    pub phases: Vec<Phase>,
}

/// Outcome of a single task attempt. `Retryable` is retried with backoff
/// up to `max_retries`; `Fatal` fails fast.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Retryable(String),
    Fatal(String),
}

/// Executes one task against its named arbiter. The orchestrator is
/// agnostic to how that dispatch happens (bus request, direct call);
/// callers supply the binding.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<Value, TaskOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub tasks: Vec<TaskResult>,
}

/// Per-session summary event emitted once the session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub succeeded: bool,
    pub aborted_at_phase: Option<String>,
}

/// Owns registered session specs and runs them against a [`TaskRunner`].
pub struct NighttimeOrchestrator {
    runner: Arc<dyn TaskRunner>,
    sessions: dashmap::DashMap<String, SessionSpec>,
    last_run: dashmap::DashMap<String, DateTime<Utc>>,
    history: parking_lot::RwLock<Vec<SessionSummary>>,
    history_cap: usize,
}

impl NighttimeOrchestrator {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            sessions: dashmap::DashMap::new(),
            last_run: dashmap::DashMap::new(),
            history: parking_lot::RwLock::new(Vec::new()),
            history_cap: 200,
        }
    }

    pub fn register_session(&self, spec: SessionSpec) {
        self.sessions.insert(spec.name.clone(), spec);
    }

    /// Interval-scheduled sessions whose interval has elapsed.
    pub fn due_sessions(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|e| e.schedule.due(self.last_run.get(e.key()).map(|r| *r), now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Run a named session's phases sequentially; tasks within a phase
    /// run concurrently. A fatal (retries exhausted or non-retryable)
    /// task failure aborts the remaining phases.
    pub async fn run_session(&self, name: &str) -> Option<SessionSummary> {
        let spec = self.sessions.get(name)?.value().clone();
        let started_at = Utc::now();
        let mut phase_results = Vec::new();
        let mut aborted_at_phase = None;

        for phase in &spec.phases {
            let results: Vec<TaskResult> = futures::future::join_all(
                phase.tasks.iter().map(|task| self.run_task_with_retry(task)),
            )
            .await;

            let phase_failed = results.iter().any(|r| !r.success);
            phase_results.push(PhaseResult {
                phase: phase.name.clone(),
                tasks: results,
            });

            if phase_failed {
                aborted_at_phase = Some(phase.name.clone());
                break;
            }
        }

        let succeeded = aborted_at_phase.is_none();
        let summary = SessionSummary {
            session: name.to_string(),
            started_at,
            finished_at: Utc::now(),
            phases: phase_results,
            succeeded,
            aborted_at_phase,
        };

        self.last_run.insert(name.to_string(), summary.finished_at);
        let mut history = self.history.write();
        history.push(summary.clone());
        if history.len() > self.history_cap {
            let excess = history.len() - self.history_cap;
            history.drain(0..excess);
        }

        Some(summary)
    }

    async fn run_task_with_retry(&self, task: &Task) -> TaskResult {
        let mut backoff_policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(300)),
            ..ExponentialBackoff::default()
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.runner.run(task).await {
                Ok(_) => {
                    return TaskResult {
                        task: task.name.clone(),
                        success: true,
                        attempts,
                        error: None,
                    }
                }
                Err(TaskOutcome::Fatal(message)) => {
                    return TaskResult {
                        task: task.name.clone(),
                        success: false,
                        attempts,
                        error: Some(message),
                    }
                }
                Err(TaskOutcome::Retryable(message)) => {
                    if !task.retryable || attempts > task.max_retries {
                        return TaskResult {
                            task: task.name.clone(),
                            success: false,
                            attempts,
                            error: Some(message),
                        };
                    }
                    match backoff_policy.next_backoff() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            return TaskResult {
                                task: task.name.clone(),
                                success: false,
                                attempts,
                                error: Some(message),
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn history(&self) -> Vec<SessionSummary> {
        self.history.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyRunner {
        fail_until: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run(&self, task: &Task) -> Result<Value, TaskOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if task.name == "always_fatal" {
                return Err(TaskOutcome::Fatal("nope".into()));
            }
            if n < self.fail_until.load(Ordering::SeqCst) {
                return Err(TaskOutcome::Retryable("try again".into()));
            }
            Ok(Value::String("ok".into()))
        }
    }

    fn task(name: &str, retryable: bool) -> Task {
        Task {
            name: name.to_string(),
            arbiter: "worker".to_string(),
            task_type: "generic".to_string(),
            params: Value::Null,
            retryable,
            max_retries: 5,
        }
    }

    #[tokio::test]
    async fn session_runs_phases_sequentially_and_fans_out_within_a_phase() {
        let runner = Arc::new(FlakyRunner {
            fail_until: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let orch = NighttimeOrchestrator::new(runner);
        orch.register_session(SessionSpec {
            name: "nightly".into(),
            schedule: Schedule::Interval(Duration::from_secs(86400)),
            phases: vec![
                Phase {
                    name: "gather".into(),
                    tasks: vec![task("a", true), task("b", true)],
                },
                Phase {
                    name: "store".into(),
                    tasks: vec![task("c", true)],
                },
            ],
        });

        let summary = orch.run_session("nightly").await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.phases.len(), 2);
        assert_eq!(summary.phases[0].tasks.len(), 2);
    }

    #[tokio::test]
    async fn retryable_failure_succeeds_after_backoff() {
        let runner = Arc::new(FlakyRunner {
            fail_until: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let orch = NighttimeOrchestrator::new(runner);
        orch.register_session(SessionSpec {
            name: "s".into(),
            schedule: Schedule::Interval(Duration::from_secs(1)),
            phases: vec![Phase {
                name: "p".into(),
                tasks: vec![task("retry_me", true)],
            }],
        });

        let summary = orch.run_session("s").await.unwrap();
        assert!(summary.succeeded);
        assert!(summary.phases[0].tasks[0].attempts >= 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_fast_and_aborts_remaining_phases() {
        let runner = Arc::new(FlakyRunner {
            fail_until: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let orch = NighttimeOrchestrator::new(runner);
        orch.register_session(SessionSpec {
            name: "s".into(),
            schedule: Schedule::Interval(Duration::from_secs(1)),
            phases: vec![
                Phase {
                    name: "p1".into(),
                    tasks: vec![task("always_fatal", false)],
                },
                Phase {
                    name: "p2".into(),
                    tasks: vec![task("never_reached", true)],
                },
            ],
        });

        let summary = orch.run_session("s").await.unwrap();
        assert!(!summary.succeeded);
        assert_eq!(summary.aborted_at_phase, Some("p1".to_string()));
        assert_eq!(summary.phases.len(), 1);
    }

    #[tokio::test]
    async fn interval_schedule_is_due_on_first_run_and_after_elapsed() {
        let runner = Arc::new(FlakyRunner {
            fail_until: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let orch = NighttimeOrchestrator::new(runner);
        orch.register_session(SessionSpec {
            name: "s".into(),
            schedule: Schedule::Interval(Duration::from_millis(10)),
            phases: vec![Phase {
                name: "p".into(),
                tasks: vec![task("a", true)],
            }],
        });

        assert_eq!(orch.due_sessions(Utc::now()), vec!["s".to_string()]);
        orch.run_session("s").await;
        assert!(orch.due_sessions(Utc::now()).is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orch.due_sessions(Utc::now()), vec!["s".to_string()]);
    }

    #[tokio::test]
    async fn cron_schedule_is_never_locally_due() {
        let runner = Arc::new(FlakyRunner {
            fail_until: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let orch = NighttimeOrchestrator::new(runner);
        orch.register_session(SessionSpec {
            name: "cron_session".into(),
            schedule: Schedule::Cron("0 2 * * *".into()),
            phases: vec![],
        });
        assert!(orch.due_sessions(Utc::now()).is_empty());
    }
}
