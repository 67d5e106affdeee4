//! Direct streaming of records too large (or unfit) to cache.
//!
//! Each open file owns a remote stream descriptor; every read issues a
//! fire-and-forget range request and waits for the matching response to be
//! delivered into the shared pending-read table.

use crate::engine::types::{
    EngineError, ReadSink, RecordEngine, StreamId, StreamTransport,
};
use crate::vfs::error::FsError;
use crate::vfs::index::Resolved;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// A stuck remote stream fails the read after this long unless configured
/// otherwise.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// In-flight range requests keyed by read_id. The transport's delivery
/// handler is the only writer; each entry has exactly one consumer and is
/// removed when consumed, cancelled or timed out.
#[derive(Default)]
pub struct PendingReads {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>,
}

impl PendingReads {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, read_id: u64) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(read_id, tx);
        rx
    }

    fn cancel(&self, read_id: u64) {
        self.waiters.lock().unwrap().remove(&read_id);
    }
}

impl ReadSink for PendingReads {
    fn deliver(&self, read_id: u64, bytes: Vec<u8>) {
        // Move the sender out under the lock; the byte transfer happens on
        // the waiter's side of the channel.
        let waiter = self.waiters.lock().unwrap().remove(&read_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            // Late response after a timeout or cancellation.
            None => debug!("dropping response for unknown read {read_id}"),
        }
    }
}

pub struct StreamingReader<E, T> {
    engine: Arc<E>,
    transport: Arc<T>,
    pending: Arc<PendingReads>,
    next_read_id: AtomicU64,
    read_timeout: Duration,
}

impl<E: RecordEngine, T: StreamTransport> StreamingReader<E, T> {
    pub fn new(engine: Arc<E>, transport: Arc<T>, read_timeout: Duration) -> Self {
        let pending = Arc::new(PendingReads::new());
        transport.connect(pending.clone());
        Self {
            engine,
            transport,
            pending,
            next_read_id: AtomicU64::new(1),
            read_timeout,
        }
    }

    /// Point query for `path`, bypassing every local cache. An ambiguous
    /// answer means the path extends past a separator boundary and denotes
    /// a directory.
    pub async fn get_attributes(&self, path: &str) -> Result<Option<Resolved>, FsError> {
        match self.engine.resolve(path).await {
            Ok(Some(record)) => Ok(Some(Resolved::Record(record))),
            Ok(None) => Ok(None),
            Err(EngineError::Ambiguous(_)) => Ok(Some(Resolved::Directory)),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a remote stream for `path`. Resolution is a fresh point query,
    /// never the attribute cache, so a stale or partial record cannot leak
    /// into the stream.
    pub async fn open(&self, path: &str) -> Result<StreamId, FsError> {
        let record = match self.get_attributes(path).await? {
            Some(Resolved::Record(record)) => record,
            _ => return Err(FsError::NotFound(path.to_string())),
        };
        if !record.can_stream() {
            return Err(FsError::NotStreamable(path.to_string()));
        }
        let stream = self.transport.open_stream(&record).await?;
        debug!("opened stream {stream:?} for {path}");
        Ok(stream)
    }

    /// Issue one range request and wait for its keyed response.
    pub async fn read(&self, stream: StreamId, offset: u64, len: u32) -> Result<Vec<u8>, FsError> {
        let read_id = self.next_read_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(read_id);
        if let Err(e) = self.transport.read_range(stream, read_id, offset, len).await {
            self.pending.cancel(read_id);
            return Err(e.into());
        }
        match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(FsError::Io(std::io::Error::other(
                "range response channel closed",
            ))),
            Err(_) => {
                self.pending.cancel(read_id);
                Err(FsError::ReadTimeout { read_id })
            }
        }
    }

    pub async fn release(&self, stream: StreamId) -> Result<(), FsError> {
        self.transport.close_stream(stream).await?;
        Ok(())
    }
}
