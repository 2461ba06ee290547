//! [F] Message bus and peer registry.
//!
//! Grounded on the teacher's `adapters/mcp/*_http.rs` request/response
//! shape and `domain/ports/mcp_client.rs`'s trait-object dispatch, turned
//! process-internal: peers register a handler trait object instead of an
//! HTTP endpoint, and correlation ids replace wire request ids.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::BusError;

/// A message envelope exchanged over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            msg_type: msg_type.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }
}

/// Implemented by anything registered on the bus to receive messages.
/// Unknown `msg_type`s should acknowledge non-fatally rather than error.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, msg: &Message) -> Result<Value, BusError>;
}

/// Capabilities and role a peer advertises at registration time.
#[derive(Debug, Clone, Default)]
pub struct PeerMeta {
    pub capabilities: Vec<String>,
    pub role: Option<String>,
}

struct PeerEntry {
    handler: Arc<dyn MessageHandler>,
    meta: PeerMeta,
}

/// Process-wide message bus. One instance is shared by every arbiter via
/// a plain reference acquired at construction (never re-materialized).
#[derive(Default)]
pub struct Bus {
    peers: DashMap<String, PeerEntry>,
    topics: DashMap<String, Vec<String>>,
    last_seen: DashMap<String, DateTime<Utc>>,
    /// Serializes publishes per (publisher, topic) pair to guarantee
    /// per-publisher FIFO delivery without blocking unrelated publishers.
    publish_gates: DashMap<(String, String), Arc<AsyncMutex<()>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under a unique name. Rejects duplicates.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn MessageHandler>, meta: PeerMeta) -> Result<(), BusError> {
        let name = name.into();
        if self.peers.contains_key(&name) {
            return Err(BusError::DuplicatePeer(name.clone()));
        }
        self.peers.insert(name.clone(), PeerEntry { handler, meta });
        self.last_seen.insert(name, Utc::now());
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.peers.remove(name);
        self.last_seen.remove(name);
        for mut topic in self.topics.iter_mut() {
            topic.retain(|s| s != name);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn peer_meta(&self, name: &str) -> Option<PeerMeta> {
        self.peers.get(name).map(|e| e.meta.clone())
    }

    /// Deliver `msg` to its `to` peer and return the handler's result.
    pub async fn send(&self, msg: Message) -> Result<Value, BusError> {
        let handler = {
            let entry = self.peers.get(&msg.to).ok_or_else(|| BusError::PeerUnknown(msg.to.clone()))?;
            entry.handler.clone()
        };
        handler
            .handle_message(&msg)
            .await
            .map_err(|_| BusError::HandlerFailed {
                peer: msg.to.clone(),
                message: msg.msg_type.clone(),
            })
    }

    /// Subscribe `name` to `topic`. The peer must already be registered.
    pub fn subscribe(&self, name: &str, topic: &str) -> Result<(), BusError> {
        if !self.peers.contains_key(name) {
            return Err(BusError::PeerUnknown(name.to_string()));
        }
        let mut subs = self.topics.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s == name) {
            subs.push(name.to_string());
        }
        Ok(())
    }

    /// Fan out `payload` on `topic` to every subscriber. Best-effort: a
    /// failing or absent subscriber never blocks others, and publish
    /// itself never fails. FIFO is guaranteed only for repeated publishes
    /// from the same `from` on the same `topic`.
    pub async fn publish(&self, from: &str, topic: &str, payload: Value) {
        let gate = self
            .publish_gates
            .entry((from.to_string(), topic.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _permit = gate.lock().await;

        let subscribers = self
            .topics
            .get(topic)
            .map(|s| s.clone())
            .unwrap_or_default();
        for sub in subscribers {
            if let Some(entry) = self.peers.get(&sub) {
                let msg = Message::new(from, sub.clone(), format!("topic:{topic}"), payload.clone());
                let _ = entry.handler.handle_message(&msg).await;
            }
        }
    }

    /// Record a heartbeat from a registered peer. Unregistered peers are
    /// rejected rather than silently recorded.
    pub fn heartbeat(&self, name: &str, _health: Value) -> Result<(), BusError> {
        if !self.peers.contains_key(name) {
            return Err(BusError::PeerUnknown(name.to_string()));
        }
        self.last_seen.insert(name.to_string(), Utc::now());
        Ok(())
    }

    pub fn last_seen(&self, name: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(name).map(|v| *v)
    }

    /// Correlated request/response with an explicit deadline.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        msg_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let mut msg = Message::new(from, to, msg_type, payload);
        msg.correlation_id = Some(msg.id);
        let timeout_ms = timeout.as_millis() as i64;
        tokio::time::timeout(timeout, self.send(msg))
            .await
            .map_err(|_| BusError::Timeout {
                to: to.to_string(),
                timeout_ms,
            })?
    }

    pub fn registered_peers(&self) -> HashMap<String, PeerMeta> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().meta.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle_message(&self, msg: &Message) -> Result<Value, BusError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(msg.payload.clone())
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register("a", Arc::new(Echo(counter.clone())), PeerMeta::default())
            .unwrap();
        let err = bus
            .register("a", Arc::new(Echo(counter)), PeerMeta::default())
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicatePeer(ref name) if name == "a"));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_errors() {
        let bus = Bus::new();
        let msg = Message::new("x", "ghost", "ping", Value::Null);
        let err = bus.send(msg).await.unwrap_err();
        assert!(matches!(err, BusError::PeerUnknown(ref name) if name == "ghost"));
    }

    #[tokio::test]
    async fn send_delivers_and_returns_handler_result() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register("echo", Arc::new(Echo(counter.clone())), PeerMeta::default())
            .unwrap();
        let msg = Message::new("x", "echo", "ping", serde_json::json!({"n": 1}));
        let result = bus.send(msg).await.unwrap();
        assert_eq!(result, serde_json::json!({"n": 1}));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers_best_effort() {
        let bus = Bus::new();
        let c1 = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::new(AtomicUsize::new(0));
        bus.register("s1", Arc::new(Echo(c1.clone())), PeerMeta::default())
            .unwrap();
        bus.register("s2", Arc::new(Echo(c2.clone())), PeerMeta::default())
            .unwrap();
        bus.subscribe("s1", "events").unwrap();
        bus.subscribe("s2", "events").unwrap();
        bus.publish("pub", "events", Value::Null).await;
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_rejected_for_unregistered_peer() {
        let bus = Bus::new();
        let err = bus.heartbeat("ghost", Value::Null).unwrap_err();
        assert!(matches!(err, BusError::PeerUnknown(ref name) if name == "ghost"));
    }

    #[tokio::test]
    async fn heartbeat_stamps_last_seen() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.register("a", Arc::new(Echo(counter)), PeerMeta::default())
            .unwrap();
        assert!(bus.last_seen("a").is_some());
        bus.heartbeat("a", Value::Null).unwrap();
        assert!(bus.last_seen("a").is_some());
    }

    #[tokio::test]
    async fn request_times_out_against_a_slow_handler() {
        struct Slow;
        #[async_trait]
        impl MessageHandler for Slow {
            async fn handle_message(&self, _msg: &Message) -> Result<Value, BusError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Value::Null)
            }
        }
        let bus = Bus::new();
        bus.register("slow", Arc::new(Slow), PeerMeta::default()).unwrap();
        let err = bus
            .request("caller", "slow", "ping", Value::Null, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
    }
}
