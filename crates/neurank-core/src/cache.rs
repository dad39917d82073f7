//! Feature cache for extractor artifacts.
//!
//! # Architecture
//!
//! A cache entry is addressed by a [`CacheKey`]: the extractor name plus a
//! SHA-256 digest over the extractor's configuration fingerprint and the
//! sorted, de-duplicated qid and docid sets it was built for. Each key holds
//! a handful of named artifacts (vocabulary, token maps, embedding matrix).
//!
//! Entries are append-only: built once, read-only afterwards. [`DiskCache`]
//! writes each artifact to a temporary sibling and renames it into place, so
//! a reader never sees a partially written file. Extractors write their
//! `manifest` artifact last; a key without a manifest is treated as a miss.
//!
//! # Critical Requirements
//!
//! - I/O failures propagate as `CacheError`, never degrade to a silent miss
//! - Statistics are lock-free atomics

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{RerankError, RerankResult};

// ============================================================================
// CACHE KEY
// ============================================================================

/// Address of a cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    digest: String,
}

impl CacheKey {
    /// Compute the key for an extractor build.
    ///
    /// Order and duplicates in `qids`/`docids` do not affect the key.
    pub fn compute<'a, Q, D>(namespace: &str, fingerprint: &str, qids: Q, docids: D) -> Self
    where
        Q: IntoIterator<Item = &'a str>,
        D: IntoIterator<Item = &'a str>,
    {
        let qids: BTreeSet<&str> = qids.into_iter().collect();
        let docids: BTreeSet<&str> = docids.into_iter().collect();

        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        hasher.update([0u8]);
        for qid in &qids {
            hasher.update(qid.as_bytes());
            hasher.update([b'\n']);
        }
        hasher.update([0u8]);
        for docid in &docids {
            hasher.update(docid.as_bytes());
            hasher.update([b'\n']);
        }

        Self {
            namespace: namespace.to_string(),
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    /// Extractor name the key belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, &self.digest[..16.min(self.digest.len())])
    }
}

// ============================================================================
// CACHE STATISTICS
// ============================================================================

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    /// Create new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Artifact reads that found data.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Artifact reads that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Artifacts written.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Hit ratio in [0, 1], 0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

// ============================================================================
// CACHE TRAIT
// ============================================================================

/// Storage for extractor artifacts.
pub trait FeatureCache: Send + Sync {
    /// Read an artifact, `None` on a miss.
    fn get(&self, key: &CacheKey, artifact: &str) -> RerankResult<Option<Vec<u8>>>;

    /// Publish an artifact.
    fn put(&self, key: &CacheKey, artifact: &str, bytes: &[u8]) -> RerankResult<()>;

    /// Lookup statistics.
    fn stats(&self) -> &CacheStats;
}

// ============================================================================
// DISK CACHE
// ============================================================================

/// Cache laid out as `<root>/<namespace>/<digest>/<artifact>`.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    stats: CacheStats,
}

impl DiskCache {
    /// Create a cache rooted at `root` (created lazily on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stats: CacheStats::new(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.namespace()).join(key.digest())
    }
}

fn cache_err(action: &str, path: &Path, e: impl std::fmt::Display) -> RerankError {
    RerankError::CacheError {
        message: format!("Failed to {} '{}': {}", action, path.display(), e),
    }
}

impl FeatureCache for DiskCache {
    fn get(&self, key: &CacheKey, artifact: &str) -> RerankResult<Option<Vec<u8>>> {
        let path = self.entry_dir(key).join(artifact);
        match std::fs::read(&path) {
            Ok(bytes) => {
                self.stats.record_hit();
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.stats.record_miss();
                Ok(None)
            }
            Err(e) => Err(cache_err("read", &path, e)),
        }
    }

    fn put(&self, key: &CacheKey, artifact: &str, bytes: &[u8]) -> RerankResult<()> {
        let dir = self.entry_dir(key);
        std::fs::create_dir_all(&dir).map_err(|e| cache_err("create", &dir, e))?;

        let path = dir.join(artifact);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| cache_err("stage", &path, e))?;
        tmp.write_all(bytes).map_err(|e| cache_err("write", &path, e))?;
        tmp.as_file().sync_all().map_err(|e| cache_err("sync", &path, e))?;
        tmp.persist(&path).map_err(|e| cache_err("publish", &path, e.error))?;

        self.stats.record_write();
        debug!(key = %key, artifact, bytes = bytes.len(), "Published cache artifact");
        Ok(())
    }

    fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

// ============================================================================
// MEMORY CACHE
// ============================================================================

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(CacheKey, String), Vec<u8>>>,
    stats: CacheStats,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureCache for MemoryCache {
    fn get(&self, key: &CacheKey, artifact: &str) -> RerankResult<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|e| RerankError::CacheError {
            message: format!("cache lock poisoned: {}", e),
        })?;
        let found = entries.get(&(key.clone(), artifact.to_string())).cloned();
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        Ok(found)
    }

    fn put(&self, key: &CacheKey, artifact: &str, bytes: &[u8]) -> RerankResult<()> {
        let mut entries = self.entries.write().map_err(|e| RerankError::CacheError {
            message: format!("cache lock poisoned: {}", e),
        })?;
        entries.insert((key.clone(), artifact.to_string()), bytes.to_vec());
        self.stats.record_write();
        Ok(())
    }

    fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_order_and_duplicates() {
        let a = CacheKey::compute("embedtext", "fp", ["301", "302"], ["d2", "d1"]);
        let b = CacheKey::compute("embedtext", "fp", ["302", "301", "301"], ["d1", "d2"]);
        assert_eq!(a, b);
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_key_separates_id_sets() {
        // moving an id between the query and document sets changes the key
        let a = CacheKey::compute("embedtext", "fp", ["x"], ["y"]);
        let b = CacheKey::compute("embedtext", "fp", Vec::<&str>::new(), ["x", "y"]);
        assert_ne!(a, b);
        let c = CacheKey::compute("embedtext", "fp2", ["x"], ["y"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_disk_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = CacheKey::compute("bagofwords", "fp", ["301"], ["d1"]);

        assert!(cache.get(&key, "vocab").unwrap().is_none());
        cache.put(&key, "vocab", b"[\"<pad>\"]").unwrap();
        assert_eq!(cache.get(&key, "vocab").unwrap().unwrap(), b"[\"<pad>\"]");

        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().writes(), 1);
        assert!((cache.stats().hit_ratio() - 0.5).abs() < 1e-9);

        let path = dir.path().join("bagofwords").join(key.digest()).join("vocab");
        assert!(path.exists());
        // no staging files left behind
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        let key = CacheKey::compute("embedtext", "fp", ["q"], ["d"]);
        cache.put(&key, "idf", &[1, 2, 3]).unwrap();
        assert_eq!(cache.get(&key, "idf").unwrap(), Some(vec![1, 2, 3]));
        assert!(cache.get(&key, "vocab").unwrap().is_none());
    }
}
