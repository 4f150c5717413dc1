// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre-mutation file snapshots.
//!
//! The first time a session mutates a path, the original bytes are copied
//! into content-addressed storage so the change can be undone or diffed
//! later.  One snapshot per (session, path) — always the pre-session state;
//! later mutations of the same path are no-ops.  Nonexistent paths snapshot
//! as deleted-markers so a subsequent creation can be undone too.
//!
//! Snapshotting is best-effort: a failure is logged and the tool call
//! proceeds ("undo may be unavailable", never "mutation is blocked").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tokio::sync::Mutex;
use tracing::warn;

/// What was on disk when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Snapshot {
    /// Content-addressed blob id (sha256 hex of the original bytes).
    Blob(String),
    /// The path did not exist.
    Deleted,
}

type Key = (String, PathBuf);

pub struct CheckpointStore {
    blob_dir: PathBuf,
    entries: Mutex<HashMap<Key, Snapshot>>,
    /// Per-(session, path) locks so concurrent snapshots of different paths
    /// proceed in parallel while same-path snapshots serialize behind the
    /// no-op check.
    locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    /// `root` holds the blob files; created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: root.into(),
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn key(session: &str, path: &Path) -> Key {
        (session.to_string(), normalize(path))
    }

    async fn path_lock(&self, key: &Key) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record the pre-mutation state of `path` for `session`.
    ///
    /// No-op when a snapshot for `(session, path)` already exists.  Errors
    /// are reported but callers are expected to ignore them (best-effort).
    pub async fn snapshot(&self, path: &Path, session: &str) -> anyhow::Result<()> {
        let key = Self::key(session, path);
        let lock = self.path_lock(&key).await;
        let _guard = lock.lock().await;

        if self.entries.lock().await.contains_key(&key) {
            return Ok(());
        }

        let snap = if key.1.is_file() {
            let bytes = tokio::fs::read(&key.1)
                .await
                .with_context(|| format!("reading {}", key.1.display()))?;
            let blob_id = hex::encode(Sha256::digest(&bytes));
            let blob_path = self.blob_dir.join(&blob_id);
            if !blob_path.exists() {
                tokio::fs::create_dir_all(&self.blob_dir).await?;
                tokio::fs::write(&blob_path, &bytes)
                    .await
                    .with_context(|| format!("writing blob {blob_id}"))?;
            }
            Snapshot::Blob(blob_id)
        } else {
            Snapshot::Deleted
        };

        self.entries.lock().await.insert(key, snap);
        Ok(())
    }

    /// Best-effort wrapper used by the dispatcher: log and continue.
    pub async fn snapshot_best_effort(&self, path: &Path, session: &str) {
        if let Err(e) = self.snapshot(path, session).await {
            warn!(path = %path.display(), error = %e, "checkpoint snapshot failed; undo may be unavailable");
        }
    }

    /// Write the snapshot for `(session, path)` back to the original
    /// location.  Returns whether a restore occurred.
    pub async fn restore(&self, path: &Path, session: &str) -> anyhow::Result<bool> {
        let key = Self::key(session, path);
        let snap = match self.entries.lock().await.get(&key).cloned() {
            Some(s) => s,
            None => return Ok(false),
        };
        match snap {
            Snapshot::Blob(blob_id) => {
                let bytes = tokio::fs::read(self.blob_dir.join(&blob_id))
                    .await
                    .with_context(|| format!("reading blob {blob_id}"))?;
                if let Some(parent) = key.1.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&key.1, bytes)
                    .await
                    .with_context(|| format!("restoring {}", key.1.display()))?;
            }
            Snapshot::Deleted => {
                // The path did not exist at snapshot time; undo the creation.
                if key.1.exists() {
                    tokio::fs::remove_file(&key.1)
                        .await
                        .with_context(|| format!("removing {}", key.1.display()))?;
                }
            }
        }
        Ok(true)
    }

    /// Unified diff between the snapshot and the current on-disk content.
    /// Returns `None` when no snapshot exists for `(session, path)`.
    pub async fn diff(&self, path: &Path, session: &str) -> anyhow::Result<Option<String>> {
        let key = Self::key(session, path);
        let snap = match self.entries.lock().await.get(&key).cloned() {
            Some(s) => s,
            None => return Ok(None),
        };
        let original = match snap {
            Snapshot::Blob(blob_id) => {
                String::from_utf8_lossy(&tokio::fs::read(self.blob_dir.join(&blob_id)).await?)
                    .into_owned()
            }
            Snapshot::Deleted => String::new(),
        };
        let current = match tokio::fs::read(&key.1).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        let name = key.1.display().to_string();
        let diff = TextDiff::from_lines(&original, &current)
            .unified_diff()
            .header(&format!("a/{name}"), &format!("b/{name}"))
            .to_string();
        Ok(Some(diff))
    }

    /// Remove all snapshots for `session`.  Blobs still referenced by other
    /// sessions are kept.
    pub async fn cleanup(&self, session: &str) {
        let mut entries = self.entries.lock().await;
        let removed: Vec<Snapshot> = entries
            .iter()
            .filter(|((s, _), _)| s == session)
            .map(|(_, snap)| snap.clone())
            .collect();
        entries.retain(|(s, _), _| s != session);

        for snap in removed {
            if let Snapshot::Blob(blob_id) = snap {
                let still_used = entries
                    .values()
                    .any(|s| matches!(s, Snapshot::Blob(b) if *b == blob_id));
                if !still_used {
                    let _ = std::fs::remove_file(self.blob_dir.join(&blob_id));
                }
            }
        }

        self.locks.lock().await.retain(|(s, _), _| s != session);
    }

    /// Paths snapshotted for `session`, sorted.
    pub async fn paths(&self, session: &str) -> Vec<PathBuf> {
        let entries = self.entries.lock().await;
        let mut v: Vec<PathBuf> = entries
            .keys()
            .filter(|(s, _)| s == session)
            .map(|(_, p)| p.clone())
            .collect();
        v.sort();
        v
    }
}

/// Absolute, lexically-normalized form of `path`.  Symlinks are not
/// resolved — a snapshot must restore to the same name the tool wrote.
fn normalize(path: &Path) -> PathBuf {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
