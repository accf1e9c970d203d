//! Bounded, compressing buffer of intermediate chunk results
//!
//! Results are keyed by chunk index and stored as opaque byte payloads.
//! Large payloads are gzip-compressed when that actually saves space, and
//! entries are evicted (LRU or FIFO) to keep the tracked total size under
//! the configured budget. The tracked size is exact after every mutation.

use crate::error::{CoreError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Payloads below this size are never worth compressing
const MIN_COMPRESS_LEN: usize = 128;

/// Fixed bookkeeping cost charged per entry
const ENTRY_OVERHEAD: usize = 64;

const SNAPSHOT_VERSION: u32 = 1;

/// Eviction policy for the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEviction {
    /// Evict the least recently read entry
    Lru,
    /// Evict the oldest inserted entry
    Fifo,
}

/// Configuration for [`ResultBuffer`]
#[derive(Debug, Clone)]
pub struct ResultBufferConfig {
    /// Total payload budget in bytes
    pub max_size_bytes: usize,
    /// Eviction policy
    pub eviction: BufferEviction,
    /// Whether to attempt gzip compression on insert
    pub compression_enabled: bool,
    /// Minimum fraction of the original size compression must save
    pub compression_min_gain: f64,
}

impl Default for ResultBufferConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 32 * 1024 * 1024,
            eviction: BufferEviction::Lru,
            compression_enabled: true,
            compression_min_gain: 0.2,
        }
    }
}

impl ResultBufferConfig {
    /// Convenience constructor taking the budget in megabytes
    pub fn with_max_size_mb(max_size_mb: usize) -> Self {
        Self {
            max_size_bytes: max_size_mb * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "max_size_bytes must be greater than 0".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.compression_min_gain) {
            return Err(CoreError::InvalidConfig {
                reason: "compression_min_gain must be in [0, 1)".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BufferEntry {
    payload: Vec<u8>,
    compressed: bool,
    size_bytes: usize,
    access_count: u64,
}

/// Counters exposed by the buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    /// Successful reads
    pub hits: u64,
    /// Reads of absent indices
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Inserts stored compressed
    pub compressions: u64,
    /// Inserts rejected because they could not fit
    pub rejected: u64,
}

impl BufferStats {
    /// Fraction of reads that hit, in [0, 1]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct BufferState {
    entries: LruCache<usize, BufferEntry>,
    total_bytes: usize,
    stats: BufferStats,
}

/// Bounded, index-keyed store of intermediate chunk results
pub struct ResultBuffer {
    config: ResultBufferConfig,
    state: Mutex<BufferState>,
}

impl ResultBuffer {
    /// Create a buffer, rejecting invalid configurations
    pub fn new(config: ResultBufferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BufferState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                stats: BufferStats::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a payload for a chunk index
    ///
    /// Evicts per policy until the entry fits; returns `false` when the
    /// payload cannot fit even into an empty buffer. Re-inserting an index
    /// replaces the previous entry.
    pub fn add(&self, index: usize, payload: &[u8]) -> bool {
        let (stored, compressed) = self.maybe_compress(payload);
        let size = stored.len() + ENTRY_OVERHEAD;

        let mut state = self.lock();
        if compressed {
            state.stats.compressions += 1;
        }
        if let Some(previous) = state.entries.pop(&index) {
            state.total_bytes -= previous.size_bytes;
        }
        while state.total_bytes + size > self.config.max_size_bytes {
            // Under FIFO, reads never promote, so LRU order equals
            // insertion order and pop_lru removes the oldest insert.
            match state.entries.pop_lru() {
                Some((victim_index, victim)) => {
                    state.total_bytes -= victim.size_bytes;
                    state.stats.evictions += 1;
                    tracing::debug!(index = victim_index, "buffer entry evicted");
                }
                None => break,
            }
        }
        if state.total_bytes + size > self.config.max_size_bytes {
            state.stats.rejected += 1;
            return false;
        }

        state.entries.put(
            index,
            BufferEntry {
                payload: stored,
                compressed,
                size_bytes: size,
                access_count: 0,
            },
        );
        state.total_bytes += size;
        true
    }

    /// Read a payload, decompressing transparently
    ///
    /// Updates recency under LRU; FIFO reads leave the order untouched.
    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let found = {
            let entry = match self.config.eviction {
                BufferEviction::Lru => state.entries.get_mut(&index),
                BufferEviction::Fifo => state.entries.peek_mut(&index),
            };
            entry.map(|entry| {
                entry.access_count += 1;
                (entry.payload.clone(), entry.compressed)
            })
        };

        match found {
            Some((payload, compressed)) => {
                state.stats.hits += 1;
                drop(state);
                if compressed {
                    match decompress(&payload) {
                        Ok(raw) => Some(raw),
                        Err(err) => {
                            tracing::warn!(index, error = %err, "buffer payload failed to decompress");
                            None
                        }
                    }
                } else {
                    Some(payload)
                }
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Read all available payloads in `[start, end)`, skipping gaps
    pub fn get_range(&self, start: usize, end: usize) -> Vec<(usize, Vec<u8>)> {
        (start..end)
            .filter_map(|index| self.get(index).map(|payload| (index, payload)))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when the buffer holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked total size in bytes
    pub fn current_size_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    /// Fraction of the budget currently used, in [0, 1]
    pub fn utilization(&self) -> f64 {
        self.lock().total_bytes as f64 / self.config.max_size_bytes as f64
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }

    /// Remove all entries
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    fn maybe_compress(&self, payload: &[u8]) -> (Vec<u8>, bool) {
        if !self.config.compression_enabled || payload.len() < MIN_COMPRESS_LEN {
            return (payload.to_vec(), false);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(payload)
            .and_then(|_| encoder.finish())
            .ok();
        match compressed {
            Some(bytes)
                if (bytes.len() as f64)
                    <= payload.len() as f64 * (1.0 - self.config.compression_min_gain) =>
            {
                (bytes, true)
            }
            _ => (payload.to_vec(), false),
        }
    }

    /// Write a warm-restart snapshot (gzip + JSON) via temp-file-then-rename
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let state = self.lock();
            BufferSnapshot {
                version: SNAPSHOT_VERSION,
                entries: state
                    .entries
                    .iter()
                    .map(|(index, entry)| {
                        (
                            *index,
                            SnapshotEntry {
                                payload: entry.payload.clone(),
                                compressed: entry.compressed,
                            },
                        )
                    })
                    .collect(),
            }
        };

        let json = serde_json::to_vec(&snapshot)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let bytes = encoder.finish()?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Restore entries from a snapshot, skipping corrupt ones
    ///
    /// Entries go through the normal bounded insert path, so restoring
    /// never exceeds the budget.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = std::fs::read(path)?;
        let mut json = Vec::new();
        GzDecoder::new(bytes.as_slice()).read_to_end(&mut json)?;
        let raw: serde_json::Value = serde_json::from_slice(&json)?;

        let version = raw.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(SNAPSHOT_VERSION)) {
            return Err(CoreError::MalformedEntry {
                reason: format!("unsupported buffer snapshot version {version:?}"),
            });
        }
        let entries = raw
            .get("entries")
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| CoreError::MalformedEntry {
                reason: "buffer snapshot has no entries map".to_string(),
            })?;

        let mut restored = 0;
        for (key, raw_entry) in entries {
            let Ok(index) = key.parse::<usize>() else {
                tracing::warn!(key, "skipping buffer snapshot entry with bad index");
                continue;
            };
            let entry: SnapshotEntry = match serde_json::from_value(raw_entry.clone()) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(index, error = %err, "skipping corrupt buffer snapshot entry");
                    continue;
                }
            };
            let payload = if entry.compressed {
                match decompress(&entry.payload) {
                    Ok(raw) => raw,
                    Err(err) => {
                        tracing::warn!(index, error = %err, "skipping undecodable buffer snapshot entry");
                        continue;
                    }
                }
            } else {
                entry.payload
            };
            if self.add(index, &payload) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    #[cfg(test)]
    fn recomputed_size(&self) -> usize {
        let state = self.lock();
        state
            .entries
            .iter()
            .map(|(_, entry)| entry.size_bytes)
            .sum()
    }
}

fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(payload).read_to_end(&mut raw)?;
    Ok(raw)
}

#[derive(Serialize, Deserialize)]
struct BufferSnapshot {
    version: u32,
    entries: BTreeMap<usize, SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    payload: Vec<u8>,
    compressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_buffer(max_size_bytes: usize, eviction: BufferEviction) -> ResultBuffer {
        ResultBuffer::new(ResultBufferConfig {
            max_size_bytes,
            eviction,
            compression_enabled: false,
            compression_min_gain: 0.2,
        })
        .unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let buffer = small_buffer(4096, BufferEviction::Lru);
        assert!(buffer.add(0, b"first"));
        assert!(buffer.add(1, b"second"));

        assert_eq!(buffer.get(0).unwrap(), b"first");
        assert_eq!(buffer.get(2), None);
        let stats = buffer.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_size_accounting_is_exact() {
        let buffer = small_buffer(64 * 1024, BufferEviction::Lru);
        for index in 0..20 {
            assert!(buffer.add(index, vec![b'x'; 100 + index].as_slice()));
        }
        // Replace a few entries with different sizes
        for index in 0..5 {
            assert!(buffer.add(index, vec![b'y'; 500].as_slice()));
        }
        assert_eq!(buffer.current_size_bytes(), buffer.recomputed_size());
    }

    #[test]
    fn test_evicts_oldest_until_new_entry_fits() {
        // Room for roughly three 100-byte entries plus overhead
        let buffer = small_buffer(3 * (100 + ENTRY_OVERHEAD), BufferEviction::Fifo);
        for index in 0..3 {
            assert!(buffer.add(index, &[b'a'; 100]));
        }
        assert!(buffer.add(3, &[b'b'; 100]));

        // Entry 0 was the oldest insert
        assert_eq!(buffer.get(0), None);
        assert!(buffer.get(3).is_some());
        assert_eq!(buffer.stats().evictions, 1);
    }

    #[test]
    fn test_lru_reads_protect_entries() {
        let buffer = small_buffer(3 * (100 + ENTRY_OVERHEAD), BufferEviction::Lru);
        for index in 0..3 {
            assert!(buffer.add(index, &[b'a'; 100]));
        }
        // Touch entry 0 so entry 1 becomes the eviction victim
        assert!(buffer.get(0).is_some());
        assert!(buffer.add(3, &[b'b'; 100]));

        assert!(buffer.get(0).is_some());
        assert_eq!(buffer.get(1), None);
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let buffer = small_buffer(256, BufferEviction::Lru);
        assert!(buffer.add(0, &[b'a'; 64]));
        assert!(!buffer.add(1, &[b'b'; 4096]));

        // The failed insert drained the buffer trying to make room
        assert_eq!(buffer.stats().rejected, 1);
        assert_eq!(buffer.current_size_bytes(), buffer.recomputed_size());
    }

    #[test]
    fn test_compression_only_when_it_pays() {
        let buffer = ResultBuffer::new(ResultBufferConfig::default()).unwrap();

        // Highly repetitive payload compresses well past the 20% threshold
        let repetitive = vec![b'z'; 8192];
        assert!(buffer.add(0, &repetitive));
        assert_eq!(buffer.stats().compressions, 1);
        assert!(buffer.current_size_bytes() < repetitive.len());

        // Reads are transparent
        assert_eq!(buffer.get(0).unwrap(), repetitive);
    }

    #[test]
    fn test_get_range_skips_gaps() {
        let buffer = small_buffer(64 * 1024, BufferEviction::Lru);
        assert!(buffer.add(0, b"zero"));
        assert!(buffer.add(2, b"two"));

        let range = buffer.get_range(0, 4);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, 0);
        assert_eq!(range[1].0, 2);
    }

    proptest::proptest! {
        /// Accounting stays exact and within budget for any add sequence
        #[test]
        fn prop_accounting_exact_under_any_add_sequence(
            ops in proptest::collection::vec((0usize..16, 1usize..600), 1..60),
            lru in proptest::prelude::any::<bool>(),
        ) {
            let eviction = if lru { BufferEviction::Lru } else { BufferEviction::Fifo };
            let buffer = small_buffer(2048, eviction);
            for (index, size) in ops {
                buffer.add(index, &vec![b'p'; size]);
                proptest::prop_assert_eq!(
                    buffer.current_size_bytes(),
                    buffer.recomputed_size()
                );
                proptest::prop_assert!(buffer.current_size_bytes() <= 2048);
            }
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json.gz");

        let buffer = ResultBuffer::new(ResultBufferConfig::default()).unwrap();
        assert!(buffer.add(0, b"alpha"));
        assert!(buffer.add(1, vec![b'q'; 4096].as_slice()));
        buffer.save_snapshot(&path).unwrap();

        let restored = ResultBuffer::new(ResultBufferConfig::default()).unwrap();
        assert_eq!(restored.load_snapshot(&path).unwrap(), 2);
        assert_eq!(restored.get(0).unwrap(), b"alpha");
        assert_eq!(restored.get(1).unwrap(), vec![b'q'; 4096]);
    }
}
