//! Record engine seam: query/download interface and the range-read transport.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Metadata the engine reports for a single record.
///
/// Immutable once obtained; a cache miss re-fetches rather than mutating.
#[derive(Clone, Debug)]
pub struct RecordInfo {
    /// Portable `/`-separated path, absolute from the mount root.
    pub path: String,
    /// Byte size, if the engine knows it. Unknown sizes force a full
    /// download before the record can be stat'ed truthfully.
    pub size: Option<u64>,
    pub last_modified: Option<SystemTime>,
    /// Whether the engine can serve arbitrary-offset range reads.
    pub can_seek: bool,
}

impl RecordInfo {
    /// A record is streamable when its size is known and it supports seeks.
    pub fn can_stream(&self) -> bool {
        self.size.is_some() && self.can_seek
    }
}

/// Engine-side token for an open range-readable resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

#[derive(Debug, Error)]
pub enum EngineError {
    /// The queried path is a prefix of several records ("not a single
    /// value"). Callers treat this as directory evidence, not a failure.
    #[error("path matches more than one record: {0}")]
    Ambiguous(String),
    /// The download primitive refused a transfer of this size.
    #[error("download of {0} bytes exceeds the allowed size")]
    SizeExceeded(u64),
    #[error("stream {0:?} is not open")]
    UnknownStream(StreamId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("record engine failure: {0}")]
    Backend(String),
}

/// Receiver for out-of-band range-read responses. The transport delivers
/// bytes keyed by the caller-chosen `read_id`; the registered sink is the
/// only writer to the pending-read table behind it.
pub trait ReadSink: Send + Sync {
    fn deliver(&self, read_id: u64, bytes: Vec<u8>);
}

/// Query side of the record engine plus the blocking download primitive.
#[async_trait]
pub trait RecordEngine: Send + Sync + 'static {
    /// Return every record whose portable path starts with `prefix`
    /// (directory form, trailing separator).
    async fn list_children(&self, prefix: &str) -> Result<Vec<RecordInfo>, EngineError>;

    /// Point query for the record exactly matching `path`.
    async fn resolve(&self, path: &str) -> Result<Option<RecordInfo>, EngineError>;

    /// Copy the record's bytes to `target`, returning the byte count.
    /// Blocks for the duration of the transfer.
    async fn download(&self, record: &RecordInfo, target: &Path) -> Result<u64, EngineError>;
}

/// Asynchronous range-read channel. `read_range` is fire-and-forget: the
/// response arrives through the connected [`ReadSink`], keyed by `read_id`.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Register the inbound response handler. Called once at mount setup,
    /// before any `read_range`.
    fn connect(&self, sink: Arc<dyn ReadSink>);

    async fn open_stream(&self, record: &RecordInfo) -> Result<StreamId, EngineError>;

    async fn read_range(
        &self,
        stream: StreamId,
        read_id: u64,
        offset: u64,
        len: u32,
    ) -> Result<(), EngineError>;

    async fn close_stream(&self, stream: StreamId) -> Result<(), EngineError>;
}
