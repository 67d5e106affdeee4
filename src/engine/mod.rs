//! Record engine adapters
//!
//! Submodules:
//! - `types`: the engine seam (traits, record metadata, errors)
//! - `localdir`: local-directory backend used by the mount binary and tests
//! - `memory`: in-memory backend for unit tests
//!
//! Responsibilities summary:
//! - Provide an async API to query records by path prefix and to resolve a
//!   single path to its metadata.
//! - Provide the blocking download primitive and the asynchronous range-read
//!   channel with out-of-band, read_id-keyed responses.

pub mod localdir;
pub mod memory;
pub mod types;

pub use localdir::LocalDirEngine;
pub use memory::InMemoryEngine;
pub use types::{EngineError, ReadSink, RecordEngine, RecordInfo, StreamId, StreamTransport};
