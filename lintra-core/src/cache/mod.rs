//! Thread-safe, bounded cache of parsed documents
//!
//! The cache enforces a joint entry-count and memory budget with pluggable
//! eviction (LRU or bounded-scan LFU), lazy TTL expiry backed by a periodic
//! sweep, and optional crash-safe snapshot persistence. Parsing always
//! happens outside the lock; the lock only guards structural mutation.

mod persistence;

use crate::document::Document;
use crate::error::{CoreError, Result};
use crate::traits::{ParseError, Parser};
use lru::LruCache;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Approximate memory cost charged per tree node
pub(crate) const APPROX_NODE_BYTES: usize = 96;

/// How many of the oldest entries the LFU-lite victim scan inspects
const LFU_SCAN_WIDTH: usize = 64;

/// Upper bound on the TTL sweep interval
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Eviction policy for the parse cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Evict the least recently used entry
    Lru,
    /// Scan the oldest [`LFU_SCAN_WIDTH`] entries and evict the least
    /// frequently used, tie-broken by insertion order
    LfuLite,
}

/// Parse mode, part of the cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Full tree with all fields
    Full,
    /// Top-level structure only
    Outline,
}

impl ParseMode {
    fn key_tag(self) -> &'static str {
        match self {
            ParseMode::Full => "full",
            ParseMode::Outline => "outline",
        }
    }
}

/// Configuration for [`ParseCache`]
#[derive(Debug, Clone)]
pub struct ParseCacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// Entry lifetime; `None` disables expiry
    pub ttl: Option<Duration>,
    /// Maximum aggregate estimated memory in bytes
    pub max_memory_bytes: usize,
    /// Eviction policy
    pub eviction_mode: EvictionMode,
    /// Snapshot file; `.gz` suffix enables gzip compression
    pub persistent_path: Option<PathBuf>,
}

impl Default for ParseCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl: Some(Duration::from_secs(3600)),
            max_memory_bytes: 64 * 1024 * 1024,
            eviction_mode: EvictionMode::Lru,
            persistent_path: None,
        }
    }
}

impl ParseCacheConfig {
    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "max_entries must be greater than 0".to_string(),
            });
        }
        if self.max_memory_bytes == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "max_memory_bytes must be greater than 0".to_string(),
            });
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(CoreError::InvalidConfig {
                reason: "ttl must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) struct CacheEntry {
    document: Arc<Document>,
    created_at: SystemTime,
    last_access: Instant,
    size_bytes: usize,
    access_count: u64,
    inserted_seq: u64,
}

/// Counters exposed by the cache
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups that returned a live entry
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed to satisfy the budgets
    pub evictions: u64,
    /// Entries removed because they outlived the TTL
    pub expirations: u64,
}

pub(crate) struct CacheState {
    entries: LruCache<String, CacheEntry>,
    total_bytes: usize,
    next_seq: u64,
    stats: CacheStats,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// Bounded, thread-safe parse-result cache
///
/// Explicitly constructed and owned; call [`ParseCache::shutdown`] (or let
/// `Drop` do it) to stop background threads and flush the final snapshot.
pub struct ParseCache {
    config: ParseCacheConfig,
    parser: Arc<dyn Parser>,
    state: Arc<Mutex<CacheState>>,
    sweeper: Option<SweeperHandle>,
    saver: Option<persistence::SaverHandle>,
}

impl ParseCache {
    /// Create a cache around a parser
    ///
    /// When a persistent path is configured, an existing snapshot is loaded
    /// (skipping corrupt or expired entries) and a background saver thread
    /// is started.
    pub fn new(config: ParseCacheConfig, parser: Arc<dyn Parser>) -> Result<Self> {
        config.validate()?;

        let mut state = CacheState {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            next_seq: 0,
            stats: CacheStats::default(),
        };
        if let Some(path) = &config.persistent_path {
            persistence::load_into(&mut state, path, config.ttl);
            // A snapshot written under a larger budget must still fit this one
            evict_to_fit(
                &mut state,
                0,
                config.max_entries.saturating_add(1),
                config.max_memory_bytes,
                config.eviction_mode,
            );
        }

        let state = Arc::new(Mutex::new(state));
        let sweeper = config
            .ttl
            .map(|ttl| SweeperHandle::spawn(Arc::clone(&state), ttl));
        let saver = config
            .persistent_path
            .clone()
            .map(|path| persistence::SaverHandle::spawn(Arc::clone(&state), path));

        Ok(Self {
            config,
            parser,
            state,
            sweeper,
            saver,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse through the cache
    ///
    /// On a hit the cached document is returned with recency and frequency
    /// bookkeeping updated. On a miss the parser runs outside the lock and
    /// the result is inserted with eviction applied first. Parse failures
    /// propagate unchanged.
    pub fn parse(
        &self,
        source: &str,
        filename: Option<&str>,
        mode: ParseMode,
    ) -> std::result::Result<Arc<Document>, ParseError> {
        let key = cache_key(source, filename, mode);
        if let Some(document) = self.lookup(&key) {
            return Ok(document);
        }

        let parsed = self.parser.parse(source, filename)?;
        let document = Arc::new(parsed.document);
        let size_bytes = document.node_count() * APPROX_NODE_BYTES;
        self.insert(key, Arc::clone(&document), size_bytes, SystemTime::now(), 0);
        self.request_save();
        Ok(document)
    }

    /// Non-parsing read
    pub fn get(&self, source: &str, filename: Option<&str>, mode: ParseMode) -> Option<Arc<Document>> {
        self.lookup(&cache_key(source, filename, mode))
    }

    /// Non-parsing write
    pub fn put(&self, source: &str, filename: Option<&str>, mode: ParseMode, document: Document) {
        let key = cache_key(source, filename, mode);
        let document = Arc::new(document);
        let size_bytes = document.node_count() * APPROX_NODE_BYTES;
        self.insert(key, document, size_bytes, SystemTime::now(), 0);
        self.request_save();
    }

    fn lookup(&self, key: &str) -> Option<Arc<Document>> {
        let ttl = self.config.ttl;
        let mut state = self.lock();

        let expired = match state.entries.peek(key) {
            Some(entry) => is_expired(entry, ttl),
            None => {
                state.stats.misses += 1;
                return None;
            }
        };
        if expired {
            state.remove(key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return None;
        }

        // get_mut promotes the entry to most recently used
        let document = state.entries.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.last_access = Instant::now();
            Arc::clone(&entry.document)
        });
        if document.is_some() {
            state.stats.hits += 1;
        }
        document
    }

    fn insert(
        &self,
        key: String,
        document: Arc<Document>,
        size_bytes: usize,
        created_at: SystemTime,
        access_count: u64,
    ) {
        if size_bytes > self.config.max_memory_bytes {
            tracing::debug!(size = size_bytes, "document too large to cache");
            return;
        }
        let mut state = self.lock();
        state.remove(&key);
        evict_to_fit(
            &mut state,
            size_bytes,
            self.config.max_entries,
            self.config.max_memory_bytes,
            self.config.eviction_mode,
        );

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.put(
            key,
            CacheEntry {
                document,
                created_at,
                last_access: Instant::now(),
                size_bytes,
                access_count,
                inserted_seq: seq,
            },
        );
        state.total_bytes += size_bytes;
    }

    fn request_save(&self) {
        if let Some(saver) = &self.saver {
            saver.request();
        }
    }

    /// Remove all entries
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate estimated memory of live entries
    pub fn memory_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Stop background threads and flush a final snapshot
    ///
    /// Idempotent; also invoked by `Drop`.
    pub fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Some(saver) = self.saver.take() {
            saver.stop();
        }
        if let Some(path) = &self.config.persistent_path {
            if let Err(err) = persistence::save(&self.state, path) {
                tracing::warn!(error = %err, "final cache snapshot failed");
            }
        }
    }
}

impl Drop for ParseCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Content hash of (source bytes, filename, parse mode)
fn cache_key(source: &str, filename: Option<&str>, mode: ParseMode) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&[0xff]);
    hasher.update(filename.unwrap_or_default().as_bytes());
    hasher.update(&[0xff]);
    hasher.update(mode.key_tag().as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn is_expired(entry: &CacheEntry, ttl: Option<Duration>) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    match entry.created_at.elapsed() {
        Ok(age) => age > ttl,
        // Clock went backwards; treat the entry as stale
        Err(_) => true,
    }
}

/// Evict entries until both budgets can accommodate one more entry of
/// `incoming_bytes`
fn evict_to_fit(
    state: &mut CacheState,
    incoming_bytes: usize,
    max_entries: usize,
    max_memory_bytes: usize,
    mode: EvictionMode,
) {
    while !state.entries.is_empty()
        && (state.entries.len() >= max_entries
            || state.total_bytes + incoming_bytes > max_memory_bytes)
    {
        let victim = match mode {
            EvictionMode::Lru => state.entries.pop_lru().map(|(key, entry)| (key, entry)),
            EvictionMode::LfuLite => {
                let key = select_lfu_victim(&state.entries);
                key.and_then(|key| state.entries.pop(&key).map(|entry| (key, entry)))
            }
        };
        match victim {
            Some((key, entry)) => {
                state.total_bytes -= entry.size_bytes;
                state.stats.evictions += 1;
                tracing::debug!(key = %key, size = entry.size_bytes, "cache entry evicted");
            }
            None => break,
        }
    }
}

/// Bounded-scan LFU: inspect only the oldest [`LFU_SCAN_WIDTH`] entries
/// and pick the one with the smallest access count, tie-broken by
/// insertion order. Caps per-eviction cost regardless of cache size.
fn select_lfu_victim(entries: &LruCache<String, CacheEntry>) -> Option<String> {
    entries
        .iter()
        .rev()
        .take(LFU_SCAN_WIDTH)
        .min_by_key(|(_, entry)| (entry.access_count, entry.inserted_seq))
        .map(|(key, _)| key.clone())
}

/// Remove every expired entry; used by the background sweep
fn sweep_expired(state: &mut CacheState, ttl: Duration) -> usize {
    let expired: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| is_expired(entry, Some(ttl)))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        state.remove(key);
    }
    state.stats.expirations += expired.len() as u64;
    expired.len()
}

struct SweeperHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    fn spawn(state: Arc<Mutex<CacheState>>, ttl: Duration) -> Self {
        let interval = MAX_SWEEP_INTERVAL.min(ttl / 10).max(Duration::from_millis(10));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("lintra-cache-sweep".to_string())
            .spawn(move || {
                let (flag, condvar) = &*stop_for_thread;
                let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    let (guard, _timeout) = condvar
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    let removed = sweep_expired(&mut state, ttl);
                    if removed > 0 {
                        tracing::debug!(removed, "ttl sweep removed expired entries");
                    }
                }
            })
            .ok();

        Self {
            stop,
            handle,
        }
    }

    fn stop(mut self) {
        let (flag, condvar) = &*self.stop;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, BlockKind, Document};
    use crate::traits::Parsed;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Parser that records how many times it ran
    struct CountingParser {
        calls: AtomicUsize,
    }

    impl CountingParser {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Parser for CountingParser {
        fn parse(&self, source: &str, _filename: Option<&str>) -> std::result::Result<Parsed, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.contains("!!syntax error!!") {
                return Err(ParseError::new("unexpected token"));
            }
            let block = Block {
                kind: BlockKind::Code,
                content: source.to_string(),
                start_line: 0,
                end_line: source.lines().count(),
                start_byte: 0,
                end_byte: source.len(),
            };
            Ok(Parsed {
                document: Document::from_blocks(std::slice::from_ref(&block)),
                warnings: Vec::new(),
            })
        }
    }

    fn cache_with(config: ParseCacheConfig) -> (ParseCache, Arc<CountingParser>) {
        let parser = CountingParser::new();
        let cache = ParseCache::new(config, parser.clone()).unwrap();
        (cache, parser)
    }

    #[test]
    fn test_second_parse_is_a_hit() {
        let (cache, parser) = cache_with(ParseCacheConfig::default());

        let first = cache.parse("x = 1\n", Some("a.py"), ParseMode::Full).unwrap();
        let second = cache.parse("x = 1\n", Some("a.py"), ParseMode::Full).unwrap();

        assert_eq!(parser.calls(), 1);
        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_key_includes_filename_and_mode() {
        let (cache, parser) = cache_with(ParseCacheConfig::default());

        cache.parse("x = 1\n", Some("a.py"), ParseMode::Full).unwrap();
        cache.parse("x = 1\n", Some("b.py"), ParseMode::Full).unwrap();
        cache.parse("x = 1\n", Some("a.py"), ParseMode::Outline).unwrap();

        assert_eq!(parser.calls(), 3);
    }

    #[test]
    fn test_parse_errors_propagate_and_are_not_cached() {
        let (cache, parser) = cache_with(ParseCacheConfig::default());

        assert!(cache.parse("!!syntax error!!", None, ParseMode::Full).is_err());
        assert!(cache.parse("!!syntax error!!", None, ParseMode::Full).is_err());
        assert_eq!(parser.calls(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_evicts_oldest_at_capacity() {
        let (cache, _) = cache_with(ParseCacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        cache.parse("a\n", None, ParseMode::Full).unwrap();
        cache.parse("b\n", None, ParseMode::Full).unwrap();
        cache.parse("c\n", None, ParseMode::Full).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a\n", None, ParseMode::Full).is_none());
        assert!(cache.get("b\n", None, ParseMode::Full).is_some());
        assert!(cache.get("c\n", None, ParseMode::Full).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_lite_keeps_frequent_entries() {
        let (cache, _) = cache_with(ParseCacheConfig {
            max_entries: 2,
            eviction_mode: EvictionMode::LfuLite,
            ..Default::default()
        });

        cache.parse("a\n", None, ParseMode::Full).unwrap();
        cache.parse("b\n", None, ParseMode::Full).unwrap();
        // Make "a" clearly more frequent than "b"
        for _ in 0..5 {
            cache.parse("a\n", None, ParseMode::Full).unwrap();
        }
        cache.parse("c\n", None, ParseMode::Full).unwrap();

        assert!(cache.get("a\n", None, ParseMode::Full).is_some());
        assert!(cache.get("b\n", None, ParseMode::Full).is_none());
    }

    #[test]
    fn test_memory_budget_is_enforced() {
        // Each parsed document is two nodes; make room for roughly two entries
        let (cache, _) = cache_with(ParseCacheConfig {
            max_entries: 100,
            max_memory_bytes: 2 * 2 * APPROX_NODE_BYTES + APPROX_NODE_BYTES,
            ..Default::default()
        });

        for source in ["a\n", "b\n", "c\n", "d\n"] {
            cache.parse(source, None, ParseMode::Full).unwrap();
        }
        assert!(cache.memory_bytes() <= 2 * 2 * APPROX_NODE_BYTES + APPROX_NODE_BYTES);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let (cache, parser) = cache_with(ParseCacheConfig {
            ttl: Some(Duration::from_millis(30)),
            ..Default::default()
        });

        cache.parse("a\n", None, ParseMode::Full).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        cache.parse("a\n", None, ParseMode::Full).unwrap();

        assert_eq!(parser.calls(), 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_put_and_get_without_parsing() {
        let (cache, parser) = cache_with(ParseCacheConfig::default());

        let document = Document::from_blocks(&[]);
        cache.put("src", None, ParseMode::Full, document.clone());
        let fetched = cache.get("src", None, ParseMode::Full).unwrap();

        assert_eq!(*fetched, document);
        assert_eq!(parser.calls(), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json.gz");

        {
            let (cache, _) = cache_with(ParseCacheConfig {
                persistent_path: Some(path.clone()),
                ..Default::default()
            });
            cache.parse("def f():\n    pass\n", Some("m.py"), ParseMode::Full).unwrap();
            // Drop flushes the final snapshot
        }
        assert!(path.exists());

        let (cache, parser) = cache_with(ParseCacheConfig {
            persistent_path: Some(path),
            ..Default::default()
        });
        cache.parse("def f():\n    pass\n", Some("m.py"), ParseMode::Full).unwrap();
        assert_eq!(parser.calls(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let (cache, _) = cache_with(ParseCacheConfig {
            persistent_path: Some(path),
            ..Default::default()
        });
        assert!(cache.is_empty());
    }
}
