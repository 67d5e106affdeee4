//! FUSE adapter and request handling
//!
//! Translates the kernel's inode-based operations onto the path-based VFS.
//! The volume is read-only: every mutating operation is refused with EROFS
//! before it reaches the VFS.
//!
//! Main components:
//! - `inodes`: lazy inode <-> path assignment
//! - `mount`: helpers for mounting via FUSE
//! - `RecordFuse`: the `Filesystem` implementation over `Vfs`

pub mod inodes;
pub mod mount;

use crate::engine::types::{RecordEngine, StreamTransport};
use crate::vfs::fs::{FileStat, FileType as VfsFileType, Vfs};
use crate::vfs::handle::DirEntry;
use crate::vfs::index::parent_of;
use bytes::Bytes;
use inodes::{InodeTable, ROOT_INO};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};

const ATTR_TTL: Duration = Duration::from_secs(1);

/// FUSE front end over the record VFS.
pub struct RecordFuse<E, T> {
    vfs: Vfs<E, T>,
    inodes: Mutex<InodeTable>,
}

impl<E: RecordEngine, T: StreamTransport> RecordFuse<E, T> {
    pub fn new(vfs: Vfs<E, T>) -> Self {
        Self {
            vfs,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.lock().unwrap().path_of(ino)
    }

    fn ino_for(&self, path: &str) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }

    /// Inode number for one snapshot entry relative to `dir`.
    fn entry_ino(&self, dir: &str, dir_ino: u64, entry: &DirEntry) -> u64 {
        match entry.name.as_str() {
            "." => dir_ino,
            ".." => {
                if dir == "/" {
                    ROOT_INO
                } else {
                    self.ino_for(&parent_of(dir))
                }
            }
            name => self.ino_for(&join_path(dir, name)),
        }
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn wants_write(flags: u32) -> bool {
    (flags as i32) & libc::O_ACCMODE != libc::O_RDONLY
}

fn vfs_kind_to_fuse(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
    }
}

fn stat_to_fuse_attr(st: &FileStat, ino: u64, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(st.mtime);
    // Fixed synthetic owner and read-only permission bits.
    let perm = match st.kind {
        VfsFileType::Dir => 0o555,
        VfsFileType::File => 0o444,
    } as u16;
    let blocks = st.size.div_ceil(512);
    rfuse3::raw::reply::FileAttr {
        ino,
        size: st.size,
        blocks,
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: vfs_kind_to_fuse(st.kind),
        perm,
        nlink: 1,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

impl<E, T> Filesystem for RecordFuse<E, T>
where
    E: RecordEngine,
    T: StreamTransport,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.vfs.destroy().await;
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let Some(parent_path) = self.path_of(parent) else {
            return Err(libc::ENOENT.into());
        };
        let child = join_path(&parent_path, name.to_string_lossy().as_ref());
        let st = match self.vfs.getattr(&child).await {
            Ok(st) => st,
            Err(e) => return Err(e.errno().into()),
        };
        let ino = self.ino_for(&child);
        let attr = stat_to_fuse_attr(&st, ino, &req);
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let st = match self.vfs.getattr(&path).await {
            Ok(st) => st,
            Err(e) => return Err(e.errno().into()),
        };
        let attr = stat_to_fuse_attr(&st, ino, &req);
        Ok(ReplyAttr { ttl: ATTR_TTL, attr })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        if wants_write(flags) {
            return Err(libc::EROFS.into());
        }
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let fh = match self.vfs.open(&path).await {
            Ok(fh) => fh,
            Err(e) => return Err(e.errno().into()),
        };
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let fh = match self.vfs.opendir(&path).await {
            Ok(fh) => fh,
            Err(e) => return Err(e.errno().into()),
        };
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = match self.vfs.read(fh, offset, size).await {
            Ok(data) => data,
            Err(e) => return Err(e.errno().into()),
        };
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.vfs.release(fh).await.map_err(|e| e.errno().into())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let snapshot = match self.vfs.readdir(&path, fh).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(e.errno().into()),
        };

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(snapshot.len());
        for (i, entry) in snapshot.iter().enumerate() {
            all.push(DirectoryEntry {
                inode: self.entry_ino(&path, ino, entry),
                kind: vfs_kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 1,
            });
        }

        // offset is "the last entry already returned"; resume past it.
        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectory::<Self::DirEntryStream<'a>> { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let snapshot = match self.vfs.readdir(&path, fh).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(e.errno().into()),
        };

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(snapshot.len());
        for (i, entry) in snapshot.iter().enumerate() {
            let entry_ino = self.entry_ino(&path, ino, entry);
            let entry_path = match entry.name.as_str() {
                "." => path.clone(),
                ".." => parent_of(&path),
                name => join_path(&path, name),
            };
            // Children that fail to stat are skipped rather than failing
            // the whole listing.
            let Ok(st) = self.vfs.getattr(&entry_path).await else {
                continue;
            };
            let attr = stat_to_fuse_attr(&st, entry_ino, &req);
            all.push(DirectoryEntryPlus {
                inode: entry_ino,
                generation: 0,
                kind: vfs_kind_to_fuse(entry.kind),
                name: OsString::from(entry.name.clone()),
                offset: (i as i64) + 1,
                attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        self.vfs.releasedir(fh).await.map_err(|e| e.errno().into())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Conservative constants; the engine exposes no usable totals.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    // ===== read-only volume: every mutation is refused =====

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(libc::EROFS.into())
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        Err(libc::EROFS.into())
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        Err(libc::EROFS.into())
    }

    async fn setattr(
        &self,
        _req: Request,
        _ino: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        Err(libc::EROFS.into())
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    // ===== bookkeeping callbacks =====

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    // Inode references are never reclaimed while mounted.
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
