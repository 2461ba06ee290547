//! [M] Content indexer: idempotent filesystem scanning, worker-pool
//! extraction, content-hash dedupe, and pausable/resumable scan state.
//!
//! Grounded on `services/adapter_loader.rs`'s non-fatal,
//! log-and-skip directory walk, generalized from a flat adapter
//! directory to a recursive tree scan.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::error::PersistError;
use crate::persistence::atomic::{read_atomic, write_atomic};

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "json", "toml", "yaml", "yml", "py", "js", "ts", "go", "java", "c", "cpp",
    "h", "sh",
];

/// Filesystem change a watcher pushes in; the indexer itself never opens
/// an inotify/kqueue handle, it only reacts to events on this channel.
#[derive(Debug, Clone)]
pub enum IndexerEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    fingerprint: String,
    content_indexed: bool,
    indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStateSnapshot {
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub scanned: u64,
    pub indexed: u64,
    pub state: ScanState,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub scanned: u64,
    pub indexed: u64,
    pub skipped_unsupported: u64,
    pub skipped_duplicate: u64,
    pub skipped_unchanged: u64,
}

/// Content-addressed journal plus worker-pool extraction over a rooted
/// directory tree.
pub struct ContentIndexer {
    root: PathBuf,
    concurrency: usize,
    journal: DashMap<String, JournalEntry>,
    content_hashes: DashMap<String, PathBuf>,
    state: parking_lot::RwLock<ScanStateSnapshot>,
    paused: Arc<AtomicBool>,
    scanned_counter: Arc<AtomicU64>,
    indexed_counter: Arc<AtomicU64>,
    events: mpsc::Receiver<IndexerEvent>,
}

impl ContentIndexer {
    /// Construct an indexer rooted at `path`. Returns the indexer and a
    /// sender watchers use to push add/change/remove events.
    pub fn new(root: impl Into<PathBuf>, concurrency: usize) -> (Self, mpsc::Sender<IndexerEvent>) {
        let root = root.into();
        let (tx, rx) = mpsc::channel(1024);
        let indexer = Self {
            state: parking_lot::RwLock::new(ScanStateSnapshot {
                path: root.clone(),
                started_at: Utc::now(),
                scanned: 0,
                indexed: 0,
                state: ScanState::Idle,
                finished_at: None,
            }),
            root,
            concurrency: concurrency.max(1),
            journal: DashMap::new(),
            content_hashes: DashMap::new(),
            paused: Arc::new(AtomicBool::new(false)),
            scanned_counter: Arc::new(AtomicU64::new(0)),
            indexed_counter: Arc::new(AtomicU64::new(0)),
            events: rx,
        };
        (indexer, tx)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.state.write().state = ScanState::Paused;
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.state.write().state = ScanState::Running;
    }

    pub fn state_snapshot(&self) -> ScanStateSnapshot {
        self.state.read().clone()
    }

    /// Deep, idempotent scan of the rooted tree. Files whose fingerprint
    /// matches the journal are skipped without reading their content.
    pub async fn scan(&self, dedupe: bool) -> ScanSummary {
        if self.paused.load(Ordering::SeqCst) {
            self.state.write().state = ScanState::Paused;
            return ScanSummary::default();
        }
        self.state.write().state = ScanState::Running;
        self.state.write().started_at = Utc::now();

        let mut summary = ScanSummary::default();
        let mut dirs = VecDeque::new();
        dirs.push_back(self.root.clone());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = Vec::new();

        while let Some(dir) = dirs.pop_front() {
            if self.paused.load(Ordering::SeqCst) {
                self.state.write().state = ScanState::Paused;
                break;
            }

            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "failed to read directory, skipping");
                    continue;
                }
            };

            while let Ok(Some(entry)) = read_dir.next_entry().await {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    dirs.push_back(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                self.scanned_counter.fetch_add(1, Ordering::Relaxed);
                summary.scanned += 1;

                if let Ok(meta) = entry.metadata().await {
                    let mtime = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let quick_fp = format!("{}:{mtime}", meta.len());
                    let key = path.display().to_string();
                    if let Some(existing) = self.journal.get(&key) {
                        if existing.content_indexed && existing.fingerprint.starts_with(&format!("{quick_fp}:"))
                        {
                            summary.skipped_unchanged += 1;
                            continue;
                        }
                    }
                }

                let permit = semaphore.clone().acquire_owned().await.unwrap();
                in_flight.push(process_one(path, dedupe, permit));
            }
        }

        for outcome in futures::future::join_all(in_flight).await {
            match outcome {
                FileOutcome::Indexed { path, fingerprint, content_hash } => {
                    if dedupe {
                        if let Some(existing) = self.content_hashes.get(&content_hash) {
                            self.journal.insert(
                                path.display().to_string(),
                                JournalEntry {
                                    fingerprint,
                                    content_indexed: true,
                                    indexed_at: Utc::now(),
                                },
                            );
                            tracing::debug!(path = %path.display(), original = %existing.display(), "duplicate content, journal recorded, not re-indexed");
                            summary.skipped_duplicate += 1;
                            continue;
                        }
                        self.content_hashes.insert(content_hash, path.clone());
                    }
                    self.journal.insert(
                        path.display().to_string(),
                        JournalEntry {
                            fingerprint,
                            content_indexed: true,
                            indexed_at: Utc::now(),
                        },
                    );
                    self.indexed_counter.fetch_add(1, Ordering::Relaxed);
                    summary.indexed += 1;
                }
                FileOutcome::Unsupported { path, fingerprint } => {
                    self.journal.insert(
                        path.display().to_string(),
                        JournalEntry {
                            fingerprint,
                            content_indexed: false,
                            indexed_at: Utc::now(),
                        },
                    );
                    summary.skipped_unsupported += 1;
                }
                FileOutcome::Unchanged => {
                    summary.skipped_unchanged += 1;
                }
                FileOutcome::Error { path, message } => {
                    tracing::warn!(path = %path.display(), error = %message, "extraction failed, skipping");
                }
            }
        }

        let mut state = self.state.write();
        state.scanned = self.scanned_counter.load(Ordering::Relaxed);
        state.indexed = self.indexed_counter.load(Ordering::Relaxed);
        if state.state != ScanState::Paused {
            state.state = ScanState::Completed;
            state.finished_at = Some(Utc::now());
        }
        drop(state);

        summary
    }

    /// Drain pending watcher events, applying add/change as a reindex of
    /// that single path and remove as a journal eviction.
    pub async fn drain_events(&mut self, dedupe: bool) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                IndexerEvent::Added(path) | IndexerEvent::Changed(path) => {
                    let permit = Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap();
                    if let FileOutcome::Indexed { path, fingerprint, content_hash } =
                        process_one(path, dedupe, permit).await
                    {
                        if !dedupe || !self.content_hashes.contains_key(&content_hash) {
                            self.content_hashes.insert(content_hash, path.clone());
                        }
                        self.journal.insert(
                            path.display().to_string(),
                            JournalEntry {
                                fingerprint,
                                content_indexed: true,
                                indexed_at: Utc::now(),
                            },
                        );
                    }
                    applied += 1;
                }
                IndexerEvent::Removed(path) => {
                    self.journal.remove(&path.display().to_string());
                    applied += 1;
                }
            }
        }
        applied
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn content_hash_len(&self) -> usize {
        self.content_hashes.len()
    }

    pub async fn persist_journal(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot: std::collections::HashMap<String, JournalEntry> = self
            .journal
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        write_atomic(path, &snapshot).await
    }

    pub async fn restore_journal(&self, path: &Path) -> Result<bool, PersistError> {
        let Some(entries) =
            read_atomic::<std::collections::HashMap<String, JournalEntry>>(path).await?
        else {
            return Ok(false);
        };
        for (k, v) in entries {
            self.journal.insert(k, v);
        }
        Ok(true)
    }

    pub async fn persist_state(&self, path: &Path) -> Result<(), PersistError> {
        let snapshot = self.state.read().clone();
        write_atomic(path, &snapshot).await
    }

    pub async fn restore_state(&self, path: &Path) -> Result<bool, PersistError> {
        let Some(snapshot) = read_atomic::<ScanStateSnapshot>(path).await? else {
            return Ok(false);
        };
        self.scanned_counter.store(snapshot.scanned, Ordering::SeqCst);
        self.indexed_counter.store(snapshot.indexed, Ordering::SeqCst);
        *self.state.write() = snapshot;
        Ok(true)
    }
}

enum FileOutcome {
    Indexed {
        path: PathBuf,
        fingerprint: String,
        content_hash: String,
    },
    Unsupported {
        path: PathBuf,
        fingerprint: String,
    },
    Unchanged,
    Error {
        path: PathBuf,
        message: String,
    },
}

async fn process_one(
    path: PathBuf,
    _dedupe: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> FileOutcome {
    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) => {
            return FileOutcome::Error {
                path,
                message: e.to_string(),
            }
        }
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let size = meta.len();

    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false);

    if !supported {
        return FileOutcome::Unsupported {
            path,
            fingerprint: format!("{size}:{mtime}"),
        };
    }

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) => {
            return FileOutcome::Error {
                path,
                message: e.to_string(),
            }
        }
    };

    let mut sha1_hasher = Sha1::new();
    sha1_hasher.update(&bytes);
    let sha1_prefix = hex_prefix(&sha1_hasher.finalize(), 8);
    let fingerprint = format!("{size}:{mtime}:{sha1_prefix}");

    let mut sha256_hasher = Sha256::new();
    sha256_hasher.update(&bytes);
    let content_hash = hex_prefix(&sha256_hasher.finalize(), 32);

    FileOutcome::Indexed {
        path,
        fingerprint,
        content_hash,
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(content.as_bytes()).await.unwrap();
        path
    }

    #[tokio::test]
    async fn scan_indexes_supported_files_and_skips_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "notes.md", "hello world").await;
        write_file(dir.path(), "image.bin", "binary-ish-content").await;

        let (indexer, _tx) = ContentIndexer::new(dir.path(), 4);
        let summary = indexer.scan(false).await;

        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.skipped_unsupported, 1);
        assert_eq!(indexer.journal_len(), 2);
    }

    #[tokio::test]
    async fn dedupe_suppresses_identical_content_across_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "same content").await;
        write_file(dir.path(), "b.txt", "same content").await;

        let (indexer, _tx) = ContentIndexer::new(dir.path(), 4);
        let summary = indexer.scan(true).await;

        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.skipped_duplicate, 1);
        assert_eq!(indexer.journal_len(), 2);
        assert_eq!(indexer.content_hash_len(), 1);
    }

    #[tokio::test]
    async fn rescan_with_unchanged_fingerprint_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "stable.txt", "constant").await;

        let (indexer, _tx) = ContentIndexer::new(dir.path(), 4);
        indexer.scan(false).await;
        let before = indexer.journal_len();
        let second = indexer.scan(false).await;
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped_unchanged, 1);
        assert_eq!(indexer.journal_len(), before);
    }

    #[tokio::test]
    async fn persist_then_restore_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "persist.txt", "content").await;
        let state_dir = tempfile::tempdir().unwrap();
        let journal_path = state_dir.path().join("index_journal.json");

        let (indexer, _tx) = ContentIndexer::new(dir.path(), 4);
        indexer.scan(false).await;
        indexer.persist_journal(&journal_path).await.unwrap();

        let (restored, _tx2) = ContentIndexer::new(dir.path(), 4);
        assert!(restored.restore_journal(&journal_path).await.unwrap());
        assert_eq!(restored.journal_len(), 1);
    }

    #[tokio::test]
    async fn watcher_event_removal_evicts_journal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "ephemeral.txt", "gone soon").await;

        let (mut indexer, tx) = ContentIndexer::new(dir.path(), 4);
        indexer.scan(false).await;
        assert_eq!(indexer.journal_len(), 1);

        tx.send(IndexerEvent::Removed(path)).await.unwrap();
        let applied = indexer.drain_events(false).await;
        assert_eq!(applied, 1);
        assert_eq!(indexer.journal_len(), 0);
    }

    #[tokio::test]
    async fn pause_stops_scan_before_completion_state() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_file(dir.path(), &format!("f{i}.txt"), "x").await;
        }
        let (indexer, _tx) = ContentIndexer::new(dir.path(), 4);
        indexer.pause();
        let summary = indexer.scan(false).await;
        assert_eq!(summary.scanned, 0);
        assert_eq!(indexer.state_snapshot().state, ScanState::Paused);
    }
}
