//! Crash-safe snapshot persistence for the parse cache
//!
//! Snapshots are JSON (gzip-compressed when the path ends in `.gz`),
//! written to a temp file in the target directory and renamed into place.
//! A dedicated saver thread serializes saves; at most one save request is
//! queued, so bursts of writes coalesce into a single snapshot.

use super::{CacheEntry, CacheState};
use crate::document::Document;
use crate::error::{CoreError, Result};
use crate::tree::TreeNode;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, SnapshotEntry>,
    stats: SnapshotStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    node_tree: serde_json::Value,
    created_at: u64,
    size_bytes: usize,
    access_count: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotStats {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Write a snapshot of the current cache state
///
/// Serialization happens under the lock; encoding and the filesystem work
/// happen outside it.
pub(super) fn save(state: &Arc<Mutex<CacheState>>, path: &Path) -> Result<()> {
    let snapshot = {
        let state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = BTreeMap::new();
        for (key, entry) in state.entries.iter() {
            let created = entry
                .created_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs();
            entries.insert(
                key.clone(),
                SnapshotEntry {
                    node_tree: serde_json::to_value(&entry.document.root)?,
                    created_at: created,
                    size_bytes: entry.size_bytes,
                    access_count: entry.access_count,
                },
            );
        }
        Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
            stats: SnapshotStats {
                hits: state.stats.hits,
                misses: state.stats.misses,
                evictions: state.stats.evictions,
                expirations: state.stats.expirations,
            },
        }
    };

    let json = serde_json::to_vec(&snapshot)?;
    let bytes = if is_gzip(path) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()?
    } else {
        json
    };

    let tmp = temp_path(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), entries = snapshot.entries.len(), "cache snapshot written");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Load a snapshot into a fresh cache state
///
/// Missing or unreadable snapshots leave the cache empty. Individual
/// entries that fail validation or have outlived the TTL are skipped;
/// the rest load normally.
pub(super) fn load_into(state: &mut CacheState, path: &Path, ttl: Option<Duration>) {
    let snapshot = match read_snapshot(path) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable cache snapshot");
            return;
        }
    };

    let mut skipped = 0usize;
    for (key, raw) in snapshot.entries {
        let created_at = UNIX_EPOCH + Duration::from_secs(raw.created_at);
        let expired = ttl.is_some_and(|ttl| {
            created_at
                .elapsed()
                .map(|age| age > ttl)
                .unwrap_or(true)
        });
        if expired {
            continue;
        }
        let root = match TreeNode::from_value(&raw.node_tree) {
            Ok(root) => root,
            Err(err) => {
                skipped += 1;
                tracing::warn!(key = %key, error = %err, "skipping malformed cache snapshot entry");
                continue;
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += raw.size_bytes;
        state.entries.put(
            key,
            CacheEntry {
                document: Arc::new(Document::new(root)),
                created_at,
                last_access: Instant::now(),
                size_bytes: raw.size_bytes,
                access_count: raw.access_count,
                inserted_seq: seq,
            },
        );
    }

    state.stats.hits = snapshot.stats.hits;
    state.stats.misses = snapshot.stats.misses;
    state.stats.evictions = snapshot.stats.evictions;
    state.stats.expirations = snapshot.stats.expirations;
    tracing::debug!(
        path = %path.display(),
        loaded = state.entries.len(),
        skipped,
        "cache snapshot loaded"
    );
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut json = Vec::new();
    if is_gzip(path) {
        GzDecoder::new(file).read_to_end(&mut json)?;
    } else {
        let mut file = file;
        file.read_to_end(&mut json)?;
    }

    let snapshot: Snapshot = serde_json::from_slice(&json)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(CoreError::MalformedEntry {
            reason: format!("unsupported snapshot version {}", snapshot.version),
        });
    }
    Ok(Some(snapshot))
}

/// Background saver: one in-flight save, one queued request at most
pub(super) struct SaverHandle {
    sender: Option<SyncSender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SaverHandle {
    pub(super) fn spawn(state: Arc<Mutex<CacheState>>, path: PathBuf) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<()>(1);
        let handle = thread::Builder::new()
            .name("lintra-cache-save".to_string())
            .spawn(move || {
                while receiver.recv().is_ok() {
                    // Coalesce requests that piled up while saving
                    while receiver.try_recv().is_ok() {}
                    if let Err(err) = save(&state, &path) {
                        tracing::warn!(error = %err, "background cache snapshot failed");
                    }
                }
            })
            .ok();

        Self {
            sender: Some(sender),
            handle,
        }
    }

    /// Request a save; a request already queued absorbs this one
    pub(super) fn request(&self) {
        if let Some(sender) = &self.sender {
            match sender.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    tracing::warn!("cache saver thread is gone; snapshot request dropped");
                }
            }
        }
    }

    /// Close the channel and wait for the thread to drain
    pub(super) fn stop(mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
