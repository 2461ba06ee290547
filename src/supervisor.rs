//! [G] Supervisor — restart policy, heartbeat deadlines, and liveness.
//!
//! Grounded on the teacher's `application/resource_monitor.rs` polling
//! loop shape and its `RetryPolicy` exponential-backoff idiom
//! (`infrastructure/claude/retry.rs`), rebuilt on the `backoff` crate's
//! `ExponentialBackoff` rather than the teacher's hand-rolled doubling —
//! the crate already does jittered exponential backoff with a cap.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::arbiter::ArbiterBase;

/// When a supervised arbiter should be restarted after it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart, on any exit.
    Permanent,
    /// Restart only after an abnormal exit (crash, missed heartbeat).
    Transient,
    /// Never restart.
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    Clean,
    Abnormal,
}

struct Supervised {
    arbiter: Arc<ArbiterBase>,
    policy: RestartPolicy,
    heartbeat_deadline: Duration,
    registration_order: usize,
    last_heartbeat: DateTime<Utc>,
}

/// Tracks registered arbiters, enforces heartbeat deadlines, and owns the
/// liveness invariant: the system terminates only once every `Permanent`
/// arbiter has cleanly reached `offline`.
pub struct Supervisor {
    entries: DashMap<String, Supervised>,
    next_order: std::sync::atomic::AtomicUsize,
    shutdown_signal: Arc<Notify>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_order: std::sync::atomic::AtomicUsize::new(0),
            shutdown_signal: Arc::new(Notify::new()),
        }
    }

    pub fn supervise(&self, name: impl Into<String>, arbiter: Arc<ArbiterBase>, policy: RestartPolicy, heartbeat_deadline: Duration) {
        let order = self.next_order.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.entries.insert(
            name.into(),
            Supervised {
                arbiter,
                policy,
                heartbeat_deadline,
                registration_order: order,
                last_heartbeat: Utc::now(),
            },
        );
    }

    pub fn record_heartbeat(&self, name: &str) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.last_heartbeat = Utc::now();
        }
    }

    /// Names whose heartbeat deadline has elapsed; treated as abnormal exits.
    pub fn overdue(&self) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| {
                let elapsed = now.signed_duration_since(e.last_heartbeat);
                elapsed.to_std().map(|d| d > e.heartbeat_deadline).unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Whether `name` should be restarted given how it exited.
    fn should_restart(&self, name: &str, exit: ExitKind) -> bool {
        self.entries
            .get(name)
            .map(|e| match e.policy {
                RestartPolicy::Permanent => true,
                RestartPolicy::Transient => exit == ExitKind::Abnormal,
                RestartPolicy::Temporary => false,
            })
            .unwrap_or(false)
    }

    /// Run `restart` with exponential backoff and jitter, capped, retrying
    /// until it succeeds or the policy says not to restart at all.
    pub async fn handle_exit<F, Fut>(&self, name: &str, abnormal: bool, mut restart: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), crate::error::ArbiterError>>,
    {
        let exit = if abnormal { ExitKind::Abnormal } else { ExitKind::Clean };
        if !self.should_restart(name, exit) {
            return;
        }

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(600)),
            ..ExponentialBackoff::default()
        };

        loop {
            match restart().await {
                Ok(()) => return,
                Err(_) => match backoff.next_backoff() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return,
                },
            }
        }
    }

    /// Shut down every supervised arbiter in reverse registration order.
    pub async fn shutdown_all(&self) {
        let mut ordered: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.registration_order, e.key().clone(), e.arbiter.clone()))
            .collect();
        ordered.sort_by_key(|(order, _, _)| std::cmp::Reverse(*order));

        for (_, _, arbiter) in ordered {
            arbiter.shutdown().await;
        }
        self.shutdown_signal.notify_waiters();
    }

    /// True once every `Permanent` arbiter has reached `offline`.
    pub fn liveness_satisfied(&self) -> bool {
        self.entries.iter().all(|e| {
            e.policy != RestartPolicy::Permanent
                || e.arbiter.status() == crate::arbiter::ArbiterStatus::Offline
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    /// Resolves once `shutdown_all` has notified waiters.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_signal.notified().await;
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
