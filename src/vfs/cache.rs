//! Bounded on-disk cache of downloaded records.
//!
//! Entries are pinned by reference count while open; zero-reference entries
//! sit in least-recently-used order and are evicted to keep occupancy under
//! `max_size - free_space_required`. Cache files are named by sha256 of the
//! portable path, fanned out `xx/rest` under the data directory.

use crate::engine::types::{EngineError, RecordEngine, RecordInfo};
use crate::vfs::error::FsError;
use crate::vfs::index::{DirectoryIndex, Resolved};
use log::{debug, warn};
use lru::LruCache;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub const DEFAULT_FREE_SPACE_REQUIRED: u64 = 100 * 1024 * 1024;

/// Cache sizing and placement options.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache directory; defaults beneath the user cache dir.
    pub data_dir: Option<PathBuf>,
    /// Total byte ceiling. None means unbounded.
    pub max_size: Option<u64>,
    /// Floor kept free below `max_size` before admitting a download.
    pub free_space_required: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_size: None,
            free_space_required: DEFAULT_FREE_SPACE_REQUIRED,
        }
    }
}

struct CacheEntry {
    record: RecordInfo,
    local_path: PathBuf,
    size: u64,
    ref_count: u32,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    occupied: u64,
    /// Zero-reference entries, least recently used first.
    idle: LruCache<String, ()>,
}

pub struct LocalCache<E> {
    engine: Arc<E>,
    data_dir: PathBuf,
    max_size: Option<u64>,
    free_space_required: u64,
    inner: Mutex<CacheInner>,
    /// One lock per portable path so concurrent opens download once.
    download_locks: tokio::sync::RwLock<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<E: RecordEngine> LocalCache<E> {
    pub fn new(engine: Arc<E>, config: CacheConfig) -> std::io::Result<Self> {
        let data_dir = config.data_dir.unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("recordfs")
        });
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            engine,
            data_dir,
            max_size: config.max_size,
            free_space_required: config.free_space_required,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                occupied: 0,
                idle: LruCache::unbounded(),
            }),
            download_locks: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    fn budget(&self) -> Option<u64> {
        self.max_size
            .map(|m| m.saturating_sub(self.free_space_required))
    }

    fn path_for(&self, portable: &str) -> PathBuf {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(portable.as_bytes());
        let hash = hex::encode(hasher.finalize());
        self.data_dir.join(&hash[0..2]).join(&hash[2..])
    }

    /// Evict zero-reference entries, oldest first, until `needed` more bytes
    /// fit under the budget. Must hold the inner lock.
    fn evict_locked(&self, inner: &mut CacheInner, needed: u64) -> Result<(), FsError> {
        let Some(budget) = self.budget() else {
            return Ok(());
        };
        while inner.occupied + needed > budget {
            let Some((victim, ())) = inner.idle.pop_lru() else {
                return Err(FsError::CapacityExceeded { needed, budget });
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                if let Err(e) = std::fs::remove_file(&entry.local_path) {
                    warn!("failed to delete evicted {victim}: {e}");
                }
                inner.occupied -= entry.size;
                debug!("evicted {victim} ({} bytes)", entry.size);
            }
        }
        Ok(())
    }

    /// Fail fast when `expected` bytes cannot possibly be admitted.
    pub fn make_room(&self, expected: u64) -> Result<(), FsError> {
        let mut inner = self.inner.lock().unwrap();
        self.evict_locked(&mut inner, expected)
    }

    fn admit(
        &self,
        path: &str,
        record: RecordInfo,
        local_path: PathBuf,
        size: u64,
    ) -> Result<(), FsError> {
        let mut inner = self.inner.lock().unwrap();
        if let Err(e) = self.evict_locked(&mut inner, size) {
            drop(inner);
            let _ = std::fs::remove_file(&local_path);
            return Err(e);
        }
        inner.occupied += size;
        inner.entries.insert(
            path.to_string(),
            CacheEntry {
                record,
                local_path,
                size,
                ref_count: 0,
            },
        );
        inner.idle.push(path.to_string(), ());
        Ok(())
    }

    /// Materialize `path` into the cache. No-op (with a recency bump) when
    /// already present. The admission check runs on the actual byte count,
    /// so occupancy never exceeds the budget even for unknown-size records.
    pub async fn cache_path(
        &self,
        index: &DirectoryIndex<E>,
        path: &str,
    ) -> Result<(), FsError> {
        if self.touch(path) {
            return Ok(());
        }
        let record = match index.resolve_attributes(path).await? {
            Some(Resolved::Record(record)) => record,
            _ => return Err(FsError::NotFound(path.to_string())),
        };
        // Known oversize records must never start a transfer.
        if let Some(expected) = record.size {
            self.make_room(expected)?;
        }

        let lock = {
            let mut locks = self.download_locks.write().await;
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        if self.touch(path) {
            // Lost the race; someone else finished the download.
            return Ok(());
        }

        let target = self.path_for(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let written = match self.engine.download(&record, &target).await {
            Ok(n) => n,
            Err(EngineError::SizeExceeded(n)) => {
                let _ = std::fs::remove_file(&target);
                return Err(FsError::CapacityExceeded {
                    needed: n,
                    budget: self.budget().unwrap_or(u64::MAX),
                });
            }
            Err(e) => {
                let _ = std::fs::remove_file(&target);
                return Err(e.into());
            }
        };
        set_modified_time(&target, record.last_modified.unwrap_or_else(SystemTime::now));
        debug!("cached {path} ({written} bytes)");
        self.admit(path, record, target, written)
    }

    /// Pin and open an already-cached path.
    pub fn open(&self, path: &str) -> Result<Arc<File>, FsError> {
        let local_path = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let entry = inner
                .entries
                .get_mut(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            entry.ref_count += 1;
            if entry.ref_count == 1 {
                inner.idle.pop(path);
            }
            entry.local_path.clone()
        };
        match File::open(&local_path) {
            Ok(file) => Ok(Arc::new(file)),
            Err(e) => {
                self.release(path);
                Err(e.into())
            }
        }
    }

    /// Drop one reference; a zero-reference entry becomes evictable again.
    pub fn release(&self, path: &str) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(path) else {
            debug!("release of uncached {path}");
            return;
        };
        debug_assert!(entry.ref_count > 0, "release without open: {path}");
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            inner.idle.push(path.to_string(), ());
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(path)
    }

    /// Bump recency if present.
    fn touch(&self, path: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(path) {
            inner.idle.promote(path);
            true
        } else {
            false
        }
    }

    /// Size and mtime of the local copy, from its own stat. Falls back to
    /// the record's reported time when the filesystem cannot answer.
    pub fn local_stat(&self, path: &str) -> Option<(u64, SystemTime)> {
        let (local_path, record_mtime) = {
            let inner = self.inner.lock().unwrap();
            let entry = inner.entries.get(path)?;
            (entry.local_path.clone(), entry.record.last_modified)
        };
        let meta = std::fs::metadata(&local_path).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .or(record_mtime)
            .unwrap_or_else(SystemTime::now);
        Some((meta.len(), mtime))
    }

    pub fn occupied(&self) -> u64 {
        self.inner.lock().unwrap().occupied
    }

    /// Teardown: delete every local copy unconditionally, ignoring
    /// reference counts.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (path, entry) in inner.entries.drain() {
            if let Err(e) = std::fs::remove_file(&entry.local_path) {
                warn!("failed to delete cached {path}: {e}");
            }
        }
        inner.idle.clear();
        inner.occupied = 0;
    }
}

fn set_modified_time(path: &Path, mtime: SystemTime) {
    let times = std::fs::FileTimes::new().set_modified(mtime);
    match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(file) => {
            if let Err(e) = file.set_times(times) {
                debug!("failed to set mtime on {}: {e}", path.display());
            }
        }
        Err(e) => debug!("failed to reopen {} for mtime: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryEngine;
    use std::os::unix::fs::FileExt;

    fn cache_with(
        engine: &Arc<InMemoryEngine>,
        dir: &Path,
        max_size: Option<u64>,
    ) -> LocalCache<InMemoryEngine> {
        LocalCache::new(
            engine.clone(),
            CacheConfig {
                data_dir: Some(dir.to_path_buf()),
                max_size,
                free_space_required: 0,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cache_open_read_release() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a.txt", b"hello world");
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), None);
        let index = DirectoryIndex::new(engine.clone());

        cache.cache_path(&index, "/a.txt").await.unwrap();
        assert!(cache.contains("/a.txt"));
        assert_eq!(cache.local_stat("/a.txt").unwrap().0, 11);
        assert_eq!(cache.occupied(), 11);

        let file = cache.open("/a.txt").unwrap();
        let mut buf = vec![0u8; 16];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        cache.release("/a.txt");

        // Second cache_path is a recency bump, not a second download.
        cache.cache_path(&index, "/a.txt").await.unwrap();
        assert_eq!(engine.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_eviction_is_lru_and_respects_pins() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a", &[1u8; 400]);
        engine.put("/b", &[2u8; 400]);
        engine.put("/c", &[3u8; 400]);
        engine.put("/d", &[4u8; 400]);
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), Some(1000));
        let index = DirectoryIndex::new(engine.clone());

        cache.cache_path(&index, "/a").await.unwrap();
        cache.cache_path(&index, "/b").await.unwrap();
        assert_eq!(cache.occupied(), 800);

        // Third entry evicts the least recently used.
        cache.cache_path(&index, "/c").await.unwrap();
        assert!(!cache.contains("/a"));
        assert!(cache.contains("/b") && cache.contains("/c"));
        assert!(cache.occupied() <= 1000);

        // A pinned entry is never evicted.
        let _file = cache.open("/b").unwrap();
        cache.cache_path(&index, "/d").await.unwrap();
        assert!(cache.contains("/b"));
        assert!(!cache.contains("/c"));
        assert!(cache.occupied() <= 1000);
    }

    #[tokio::test]
    async fn test_capacity_error_when_everything_pinned() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a", &[1u8; 400]);
        engine.put("/b", &[2u8; 400]);
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), Some(500));
        let index = DirectoryIndex::new(engine.clone());

        cache.cache_path(&index, "/a").await.unwrap();
        let _file = cache.open("/a").unwrap();
        match cache.cache_path(&index, "/b").await {
            Err(FsError::CapacityExceeded { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(cache.occupied(), 400);
    }

    #[tokio::test]
    async fn test_oversize_record_never_downloads() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put_virtual("/big.bin", b"", 5_000_000_000);
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), Some(1_000_000));
        let index = DirectoryIndex::new(engine.clone());

        match cache.cache_path(&index, "/big.bin").await {
            Err(FsError::CapacityExceeded { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(engine.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_size_admits_actual_bytes() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put_unknown_size("/nosize.bin", b"1234567");
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), Some(1000));
        let index = DirectoryIndex::new(engine.clone());

        cache.cache_path(&index, "/nosize.bin").await.unwrap();
        assert_eq!(cache.occupied(), 7);
        assert_eq!(cache.local_stat("/nosize.bin").unwrap().0, 7);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a", &[0u8; 10]);
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache_with(&engine, tmp.path(), None);
        let index = DirectoryIndex::new(engine.clone());
        cache.cache_path(&index, "/a").await.unwrap();
        let _pinned = cache.open("/a").unwrap();
        cache.clear();
        assert!(!cache.contains("/a"));
        assert_eq!(cache.occupied(), 0);
    }
}
