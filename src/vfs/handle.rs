//! Handle allocation and the mount-owned table of open resources.

use crate::engine::types::StreamId;
use crate::vfs::fs::FileType;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Issues monotonically increasing handle numbers. No reuse, no recycling:
/// a released handle number is never handed out again for the lifetime of
/// the mount.
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One name inside a directory snapshot.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// What an open handle refers to. `read`/`release` dispatch on the tag.
#[derive(Clone)]
pub enum OpenHandle {
    /// Snapshot taken at opendir time; served unchanged until releasedir.
    Dir(Arc<Vec<DirEntry>>),
    Cached { path: String, file: Arc<File> },
    Streamed { path: String, stream: StreamId },
}

/// Open-resource table. Owned exclusively by the mount.
pub struct HandleTable {
    alloc: HandleAllocator,
    inner: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            alloc: HandleAllocator::new(),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.alloc.next();
        self.inner.lock().unwrap().insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.inner.lock().unwrap().get(&fh).cloned()
    }

    pub fn take(&self, fh: u64) -> Option<OpenHandle> {
        self.inner.lock().unwrap().remove(&fh)
    }

    /// Drain every open handle (mount teardown).
    pub fn drain(&self) -> Vec<OpenHandle> {
        self.inner.lock().unwrap().drain().map(|(_, h)| h).collect()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
