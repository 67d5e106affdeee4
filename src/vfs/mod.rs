//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Emulate directory semantics over the engine's flat, queryable
//!   namespace and memoize listings and attributes.
//! - Decide per open whether a record is cached to local disk or streamed
//!   directly, and keep the handle/resource bookkeeping safe under
//!   concurrent filesystem calls.
//! - Convert every internal failure to the nearest POSIX error code at the
//!   mount boundary.
//!
//! Submodules:
//! - `fs`: the mount itself (getattr/open/read/release and friends)
//! - `index`: directory listings, known-directory inference, attribute cache
//! - `cache`: bounded on-disk cache with refcount-aware LRU eviction
//! - `stream`: direct range-read streaming and the pending-read table
//! - `handle`: handle allocation and the open-resource table
//! - `error`: error taxonomy and errno conversion

pub mod cache;
pub mod error;
pub mod fs;
pub mod handle;
pub mod index;
pub mod stream;

pub use cache::CacheConfig;
pub use error::FsError;
pub use fs::{FileStat, FileType, FsOptions, Vfs};
