//! Path-based virtual filesystem over the record engine: stat, directory
//! listing and the cache-or-stream open/read/release lifecycle.

use crate::engine::types::{RecordEngine, StreamTransport};
use crate::vfs::cache::{CacheConfig, LocalCache};
use crate::vfs::error::FsError;
use crate::vfs::handle::{DirEntry, HandleTable, OpenHandle};
use crate::vfs::index::{DirectoryIndex, Resolved};
use crate::vfs::stream::{StreamingReader, DEFAULT_READ_TIMEOUT};
use log::debug;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Zero-size probe file tools can stat to confirm the mount is alive.
pub const MOUNT_PROBE: &str = "/.mount-probe";

/// Desktop trash bookkeeping is never exposed on a read-only volume.
pub const TRASH_PREFIX: &str = "/.Trash";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug)]
pub struct FileStat {
    pub kind: FileType,
    pub size: u64,
    pub mtime: SystemTime,
}

impl FileStat {
    fn file(size: u64, mtime: SystemTime) -> Self {
        Self { kind: FileType::File, size, mtime }
    }

    fn dir() -> Self {
        Self { kind: FileType::Dir, size: 0, mtime: SystemTime::now() }
    }
}

#[derive(Debug, Clone)]
pub struct FsOptions {
    pub cache: CacheConfig,
    /// How long a streamed read waits for its range response.
    pub stream_read_timeout: Duration,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            stream_read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// The active mount: composes the directory index, the local cache and the
/// streaming reader, and arbitrates which of the latter two owns each open
/// handle.
pub struct Vfs<E, T> {
    index: DirectoryIndex<E>,
    cache: LocalCache<E>,
    streams: StreamingReader<E, T>,
    handles: HandleTable,
}

/// Collapse a path to its canonical absolute form.
pub fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn child_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

impl<E: RecordEngine, T: StreamTransport> Vfs<E, T> {
    pub fn new(engine: Arc<E>, transport: Arc<T>, opts: FsOptions) -> std::io::Result<Self> {
        Ok(Self {
            index: DirectoryIndex::new(engine.clone()),
            cache: LocalCache::new(engine.clone(), opts.cache)?,
            streams: StreamingReader::new(engine, transport, opts.stream_read_timeout),
            handles: HandleTable::new(),
        })
    }

    pub async fn getattr(&self, path: &str) -> Result<FileStat, FsError> {
        let path = norm_path(path);
        if path == MOUNT_PROBE {
            return Ok(FileStat::file(0, SystemTime::now()));
        }
        if path.starts_with(TRASH_PREFIX) {
            return Err(FsError::NotFound(path));
        }
        // A materialized copy is authoritative: its stat carries the true
        // size even when the engine never reported one.
        if let Some((size, mtime)) = self.cache.local_stat(&path) {
            return Ok(FileStat::file(size, mtime));
        }
        if let Some(record) = self.index.cached_attrs(&path) {
            if let Some(size) = record.size {
                let mtime = record.last_modified.unwrap_or_else(SystemTime::now);
                return Ok(FileStat::file(size, mtime));
            }
        }
        if self.index.is_known_dir(&path) {
            return Ok(FileStat::dir());
        }
        match self.index.resolve_attributes(&path).await? {
            Some(Resolved::Record(record)) => match record.size {
                Some(size) => {
                    let mtime = record.last_modified.unwrap_or_else(SystemTime::now);
                    Ok(FileStat::file(size, mtime))
                }
                // Unknown size: the only way to answer truthfully is to
                // materialize the record and stat the copy.
                None => {
                    debug!("unknown-size record {path}: forcing full download");
                    self.cache.cache_path(&self.index, &path).await?;
                    let (size, mtime) = self
                        .cache
                        .local_stat(&path)
                        .ok_or_else(|| FsError::UnknownSize(path.clone()))?;
                    Ok(FileStat::file(size, mtime))
                }
            },
            Some(Resolved::Directory) => Ok(FileStat::dir()),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Open for reading. Cache first; records the cache cannot admit fall
    /// back to direct streaming.
    pub async fn open(&self, path: &str) -> Result<u64, FsError> {
        let path = norm_path(path);
        match self.cache.cache_path(&self.index, &path).await {
            Ok(()) => {
                let file = self.cache.open(&path)?;
                Ok(self.handles.insert(OpenHandle::Cached { path, file }))
            }
            Err(FsError::CapacityExceeded { .. }) => {
                debug!("{path} does not fit the cache, streaming instead");
                let stream = self.streams.open(&path).await?;
                Ok(self.handles.insert(OpenHandle::Streamed { path, stream }))
            }
            Err(e) => Err(e),
        }
    }

    /// Positioned read on an open handle. Returns the bytes read; empty at
    /// end of file.
    pub async fn read(&self, fh: u64, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        match self.handles.get(fh) {
            Some(OpenHandle::Cached { file, .. }) => {
                let mut buf = vec![0u8; len as usize];
                let n = file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            }
            Some(OpenHandle::Streamed { stream, .. }) => {
                self.streams.read(stream, offset, len).await
            }
            Some(OpenHandle::Dir(_)) | None => Err(FsError::StaleHandle(fh)),
        }
    }

    pub async fn release(&self, fh: u64) -> Result<(), FsError> {
        match self.handles.take(fh) {
            Some(OpenHandle::Cached { path, file }) => {
                drop(file);
                self.cache.release(&path);
                Ok(())
            }
            Some(OpenHandle::Streamed { stream, .. }) => self.streams.release(stream).await,
            Some(OpenHandle::Dir(_)) => Ok(()),
            None => Err(FsError::StaleHandle(fh)),
        }
    }

    pub async fn opendir(&self, path: &str) -> Result<u64, FsError> {
        let path = norm_path(path);
        let snapshot = self.snapshot_dir(&path).await?;
        Ok(self.handles.insert(OpenHandle::Dir(Arc::new(snapshot))))
    }

    /// Serve the snapshot taken at opendir time; recompute defensively when
    /// the handle is not found (some callers skip opendir).
    pub async fn readdir(&self, path: &str, fh: u64) -> Result<Arc<Vec<DirEntry>>, FsError> {
        if let Some(OpenHandle::Dir(snapshot)) = self.handles.get(fh) {
            return Ok(snapshot);
        }
        debug!("readdir without an open handle for {path}, recomputing");
        Ok(Arc::new(self.snapshot_dir(&norm_path(path)).await?))
    }

    pub async fn releasedir(&self, fh: u64) -> Result<(), FsError> {
        match self.handles.take(fh) {
            Some(_) => Ok(()),
            None => Err(FsError::StaleHandle(fh)),
        }
    }

    /// Mount teardown: close whatever is still open and drop every cached
    /// byte.
    pub async fn destroy(&self) {
        for handle in self.handles.drain() {
            match handle {
                OpenHandle::Streamed { stream, path } => {
                    debug!("closing leftover stream for {path}");
                    let _ = self.streams.release(stream).await;
                }
                OpenHandle::Cached { path, .. } => self.cache.release(&path),
                OpenHandle::Dir(_) => {}
            }
        }
        self.cache.clear();
    }

    async fn snapshot_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let names = self.index.list_entries(path).await?;
        if names.is_empty() && path != "/" && !self.index.is_known_dir(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let mut entries = Vec::with_capacity(names.len() + 2);
        entries.push(DirEntry { name: ".".to_string(), kind: FileType::Dir });
        entries.push(DirEntry { name: "..".to_string(), kind: FileType::Dir });
        for name in names.iter() {
            let kind = if self.index.is_known_dir(&child_path(path, name)) {
                FileType::Dir
            } else {
                FileType::File
            };
            entries.push(DirEntry { name: name.clone(), kind });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryEngine;

    fn vfs_with(
        engine: &Arc<InMemoryEngine>,
        dir: &std::path::Path,
        max_size: Option<u64>,
    ) -> Vfs<InMemoryEngine, InMemoryEngine> {
        Vfs::new(
            engine.clone(),
            engine.clone(),
            FsOptions {
                cache: CacheConfig {
                    data_dir: Some(dir.to_path_buf()),
                    max_size,
                    free_space_required: 0,
                },
                stream_read_timeout: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a.txt", b"hello world");
        engine.put_virtual("/dir/b.txt", b"stream-head", 5_000_000_000);
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), Some(1_000_000));

        // stat
        let st = vfs.getattr("/a.txt").await.unwrap();
        assert_eq!(st.kind, FileType::File);
        assert_eq!(st.size, 11);
        assert_eq!(vfs.getattr("/dir").await.unwrap().kind, FileType::Dir);
        assert_eq!(vfs.getattr("/dir/b.txt").await.unwrap().size, 5_000_000_000);

        // root listing
        let dh = vfs.opendir("/").await.unwrap();
        let listing = vfs.readdir("/", dh).await.unwrap();
        assert_eq!(names(&listing), [".", "..", "a.txt", "dir"]);
        assert_eq!(listing[3].kind, FileType::Dir);
        vfs.releasedir(dh).await.unwrap();

        // small record: cached, then read to EOF
        let fh = vfs.open("/a.txt").await.unwrap();
        assert_eq!(vfs.read(fh, 0, 11).await.unwrap(), b"hello world");
        assert!(vfs.read(fh, 11, 4096).await.unwrap().is_empty());
        vfs.release(fh).await.unwrap();
        assert_eq!(engine.download_calls(), 1);

        // oversize record: streamed, never downloaded
        let fh = vfs.open("/dir/b.txt").await.unwrap();
        let chunk = vfs.read(fh, 0, 4096).await.unwrap();
        assert_eq!(chunk.len(), 4096);
        assert_eq!(&chunk[..11], b"stream-head");
        vfs.release(fh).await.unwrap();
        assert_eq!(engine.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_stat_open_consistency() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/data.bin", &[9u8; 3000]);
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), None);

        let size = vfs.getattr("/data.bin").await.unwrap().size;
        let fh = vfs.open("/data.bin").await.unwrap();
        let mut total = 0u64;
        let mut offset = 0u64;
        loop {
            let chunk = vfs.read(fh, offset, 1024).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            total += chunk.len() as u64;
            offset += chunk.len() as u64;
        }
        assert_eq!(total, size);
        vfs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_size_resolves_to_downloaded_bytes() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put_unknown_size("/nosize.bin", b"1234567");
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), Some(1_000_000));

        let st = vfs.getattr("/nosize.bin").await.unwrap();
        assert_eq!(st.kind, FileType::File);
        assert_eq!(st.size, 7);
        assert_eq!(engine.download_calls(), 1);

        // The copy now answers stats; no further downloads.
        let st = vfs.getattr("/nosize.bin").await.unwrap();
        assert_eq!(st.size, 7);
        assert_eq!(engine.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_readdir_is_stable_per_handle() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/x/1", b"1");
        engine.put("/x/2", b"2");
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), None);

        let dh = vfs.opendir("/x").await.unwrap();
        let first = vfs.readdir("/x", dh).await.unwrap();
        let second = vfs.readdir("/x", dh).await.unwrap();
        assert_eq!(names(&first), names(&second));
        vfs.releasedir(dh).await.unwrap();

        // Released handle: the listing is recomputed defensively.
        let recomputed = vfs.readdir("/x", dh).await.unwrap();
        assert_eq!(names(&recomputed), names(&first));
    }

    #[tokio::test]
    async fn test_probe_and_trash_paths() {
        let engine = Arc::new(InMemoryEngine::new());
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), None);

        let st = vfs.getattr(MOUNT_PROBE).await.unwrap();
        assert_eq!(st.kind, FileType::File);
        assert_eq!(st.size, 0);

        assert!(matches!(
            vfs.getattr("/.Trash/files/x").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            vfs.getattr("/.Trash-1000").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_without_streaming_fails_big() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put_unseekable("/pipe.bin", &[0u8; 2000]);
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), Some(500));

        match vfs.open("/pipe.bin").await {
            Err(FsError::NotStreamable(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(engine.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_handles_are_defensive() {
        let engine = Arc::new(InMemoryEngine::new());
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), None);

        assert!(matches!(vfs.read(99, 0, 16).await, Err(FsError::StaleHandle(99))));
        assert!(matches!(vfs.release(99).await, Err(FsError::StaleHandle(99))));
        assert!(matches!(vfs.releasedir(99).await, Err(FsError::StaleHandle(99))));
        assert!(matches!(
            vfs.open("/missing").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_opens_download_once() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a.txt", b"hello world");
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Arc::new(vfs_with(&engine, tmp.path(), None));

        let (a, b) = tokio::join!(vfs.open("/a.txt"), vfs.open("/a.txt"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
        assert_eq!(engine.download_calls(), 1);
        vfs.release(a).await.unwrap();
        vfs.release(b).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_clears_cache() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.put("/a.txt", b"hello");
        engine.put_virtual("/big", b"", 1 << 40);
        let tmp = tempfile::tempdir().unwrap();
        let vfs = vfs_with(&engine, tmp.path(), Some(1000));

        let cached = vfs.open("/a.txt").await.unwrap();
        let streamed = vfs.open("/big").await.unwrap();
        assert_ne!(cached, streamed);
        vfs.destroy().await;

        // Everything was torn down, handles included.
        assert!(matches!(
            vfs.read(cached, 0, 4).await,
            Err(FsError::StaleHandle(_))
        ));
        assert_eq!(vfs.cache.occupied(), 0);
    }
}
