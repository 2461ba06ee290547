//! [L] Tiered memory cascade: hot TTL cache, warm vector set, cold
//! persistent store.
//!
//! Grounded on `domain/models/memory.rs`'s tier/TTL/promotion concept,
//! generalized from the teacher's working/episodic/semantic split to
//! this spec's hot/warm/cold cascade. Content addressing via `sha2`
//! (imported for this purpose from the `seanchatmangpt-knhk` example,
//! which hashes workflow artifacts the same way).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::PersistError;
use crate::persistence::atomic::{read_atomic, write_atomic};

/// Injected embedding provider. Absence degrades gracefully to
/// substring/importance search rather than failing.
pub trait Embedder: Send + Sync {
    fn embed(&self, content: &str) -> Option<Vec<f32>>;
}

/// Authoritative record. Cold is the source of truth; hot and warm are
/// eventually-consistent caches over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdEntry {
    pub id: String,
    pub content: String,
    pub meta: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub importance: f64,
}

struct WarmEntry {
    id: String,
    vector: Vec<f32>,
    snippet: String,
    created_at: DateTime<Utc>,
}

struct HotEntry {
    results: Vec<ColdEntry>,
    expires_at: Instant,
}

/// Three-tier memory cascade shared across arbiters (serialized on
/// internal locks per spec section 5's shared-resource policy).
pub struct MemoryTiers {
    hot: DashMap<String, HotEntry>,
    hot_ttl: Duration,
    warm: parking_lot::RwLock<Vec<WarmEntry>>,
    cold: DashMap<String, ColdEntry>,
    embedder: Option<Box<dyn Embedder>>,
    hot_degraded: AtomicBool,
}

impl MemoryTiers {
    pub fn new(hot_ttl: Duration, embedder: Option<Box<dyn Embedder>>) -> Self {
        Self {
            hot: DashMap::new(),
            hot_ttl,
            warm: parking_lot::RwLock::new(Vec::new()),
            cold: DashMap::new(),
            embedder,
            hot_degraded: AtomicBool::new(false),
        }
    }

    fn content_id(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    }

    /// Mark the hot tier degraded. Logs a warning exactly once; callers
    /// continue to operate correctly against warm/cold with no data loss.
    pub fn mark_hot_degraded(&self) {
        if self.hot_degraded.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            tracing::warn!("hot memory tier degraded, serving from warm/cold only");
        }
    }

    fn hot_available(&self) -> bool {
        !self.hot_degraded.load(Ordering::Relaxed)
    }

    /// Content-addressed write. Cold is authoritative; hot gets a
    /// short-TTL copy; warm gets a vector if embedding succeeds.
    pub fn remember(&self, content: impl Into<String>, meta: HashMap<String, serde_json::Value>) -> String {
        let content = content.into();
        let id = Self::content_id(&content);
        let now = Utc::now();
        let entry = ColdEntry {
            id: id.clone(),
            content: content.clone(),
            meta,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            importance: 0.5,
        };
        self.cold.insert(id.clone(), entry.clone());

        if self.hot_available() {
            self.hot.insert(
                content.clone(),
                HotEntry {
                    results: vec![entry],
                    expires_at: Instant::now() + self.hot_ttl,
                },
            );
        }

        if let Some(embedder) = &self.embedder {
            if let Some(vector) = embedder.embed(&content) {
                self.warm.write().push(WarmEntry {
                    id: id.clone(),
                    vector,
                    snippet: content.chars().take(200).collect(),
                    created_at: now,
                });
            }
        }

        id
    }

    /// Cascade: hot (literal key) -> warm (vector similarity) -> cold
    /// (substring + importance order), promoting hits upward.
    pub fn recall(&self, query: &str, k: usize) -> Vec<ColdEntry> {
        if self.hot_available() {
            if let Some(entry) = self.hot.get(query) {
                if entry.expires_at > Instant::now() {
                    return entry.results.iter().take(k).cloned().collect();
                }
            }
        }

        if let Some(embedder) = &self.embedder {
            if let Some(query_vector) = embedder.embed(query) {
                let hits = self.warm_search(&query_vector, k);
                if !hits.is_empty() {
                    let resolved: Vec<ColdEntry> = hits
                        .into_iter()
                        .filter_map(|id| self.touch_cold(&id))
                        .collect();
                    self.promote_to_hot(query, resolved.clone());
                    return resolved;
                }
            }
        }

        let needle = query.to_lowercase();
        let mut hits: Vec<ColdEntry> = self
            .cold
            .iter()
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .map(|e| e.clone())
            .collect();
        hits.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap());
        hits.truncate(k);

        for hit in &hits {
            self.touch_cold(&hit.id);
            if let Some(embedder) = &self.embedder {
                if let Some(vector) = embedder.embed(&hit.content) {
                    let mut warm = self.warm.write();
                    if !warm.iter().any(|w| w.id == hit.id) {
                        warm.push(WarmEntry {
                            id: hit.id.clone(),
                            vector,
                            snippet: hit.content.chars().take(200).collect(),
                            created_at: Utc::now(),
                        });
                    }
                }
            }
        }
        self.promote_to_hot(query, hits.clone());
        hits
    }

    fn touch_cold(&self, id: &str) -> Option<ColdEntry> {
        self.cold.get_mut(id).map(|mut e| {
            e.accessed_at = Utc::now();
            e.access_count += 1;
            e.clone()
        })
    }

    fn promote_to_hot(&self, query: &str, results: Vec<ColdEntry>) {
        if !self.hot_available() || results.is_empty() {
            return;
        }
        self.hot.insert(
            query.to_string(),
            HotEntry {
                results,
                expires_at: Instant::now() + self.hot_ttl,
            },
        );
    }

    fn warm_search(&self, query_vector: &[f32], k: usize) -> Vec<String> {
        let warm = self.warm.read();
        let mut scored: Vec<(f64, &str)> = warm
            .iter()
            .map(|w| (cosine_similarity(query_vector, &w.vector), w.id.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        scored
            .into_iter()
            .filter(|(score, _)| *score > 0.0)
            .take(k)
            .map(|(_, id)| id.to_string())
            .collect()
    }

    /// Remove `id` from every tier.
    pub fn forget(&self, id: &str) {
        self.cold.remove(id);
        self.hot.retain(|_, v| !v.results.iter().any(|e| e.id == id));
        self.warm.write().retain(|w| w.id != id);
    }

    /// Delete cold entries older than 30 days with importance < 0.3.
    pub fn auto_cleanup(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(30);
        let stale: Vec<String> = self
            .cold
            .iter()
            .filter(|e| e.created_at < cutoff && e.importance < 0.3)
            .map(|e| e.id.clone())
            .collect();
        for id in &stale {
            self.forget(id);
        }
        stale.len()
    }

    pub fn cold_len(&self) -> usize {
        self.cold.len()
    }

    pub fn warm_len(&self) -> usize {
        self.warm.read().len()
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Evict every hot-tier entry without touching warm or cold. Used to
    /// simulate hot-cache expiry/restart in tests and operational
    /// cache-busting.
    pub fn flush_hot(&self) {
        self.hot.clear();
    }

    /// Evict every warm-tier entry without touching hot or cold.
    pub fn flush_warm(&self) {
        self.warm.write().clear();
    }

    pub async fn persist(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot: Vec<ColdEntry> = self.cold.iter().map(|e| e.clone()).collect();
        write_atomic(path, &snapshot).await
    }

    pub async fn restore(&self, path: &Path) -> Result<bool, PersistError> {
        let Some(entries) = read_atomic::<Vec<ColdEntry>>(path).await? else {
            return Ok(false);
        };
        for entry in entries {
            self.cold.insert(entry.id.clone(), entry);
        }
        Ok(true)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len).map(|b| format!("{b:02x}")).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)) as f64
    }
}
