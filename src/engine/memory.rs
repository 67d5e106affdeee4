//! In-memory engine backend for unit tests and local development.
//!
//! Records carry per-entry knobs (hidden size, unseekable, virtual size,
//! download limit) so callers can exercise the unknown-size, oversize and
//! failure paths without touching real storage.

use crate::engine::types::{
    EngineError, ReadSink, RecordEngine, RecordInfo, StreamId, StreamTransport,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Clone)]
struct MemRecord {
    data: Arc<Vec<u8>>,
    /// Report no size to the query interface.
    hide_size: bool,
    /// Advertise this size instead of the data length; reads past the real
    /// data are zero-filled. Lets tests model multi-gigabyte records.
    virtual_size: Option<u64>,
    can_seek: bool,
    mtime: SystemTime,
}

impl MemRecord {
    fn size(&self) -> u64 {
        self.virtual_size.unwrap_or(self.data.len() as u64)
    }

    fn info(&self, path: &str) -> RecordInfo {
        RecordInfo {
            path: path.to_string(),
            size: if self.hide_size {
                None
            } else {
                Some(self.size())
            },
            last_modified: Some(self.mtime),
            can_seek: self.can_seek,
        }
    }

    fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let total = self.size();
        if offset >= total {
            return Vec::new();
        }
        let len = len.min((total - offset) as usize);
        let mut out = vec![0u8; len];
        let data_len = self.data.len() as u64;
        if offset < data_len {
            let start = offset as usize;
            let end = (start + len).min(self.data.len());
            out[..end - start].copy_from_slice(&self.data[start..end]);
        }
        out
    }
}

#[derive(Default)]
pub struct InMemoryEngine {
    records: Mutex<BTreeMap<String, MemRecord>>,
    streams: Mutex<HashMap<StreamId, String>>,
    next_stream: AtomicU64,
    sink: Mutex<Option<Arc<dyn ReadSink>>>,
    download_limit: Mutex<Option<u64>>,
    list_calls: AtomicU64,
    download_calls: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: &[u8]) {
        self.insert(path, data, false, None, true);
    }

    /// Record whose size the query interface does not report.
    pub fn put_unknown_size(&self, path: &str, data: &[u8]) {
        self.insert(path, data, true, None, true);
    }

    /// Record that refuses arbitrary-offset range reads.
    pub fn put_unseekable(&self, path: &str, data: &[u8]) {
        self.insert(path, data, false, None, false);
    }

    /// Record advertising `size` bytes without holding them; reads beyond
    /// `data` are zero-filled.
    pub fn put_virtual(&self, path: &str, data: &[u8], size: u64) {
        self.insert(path, data, false, Some(size), true);
    }

    fn insert(&self, path: &str, data: &[u8], hide_size: bool, virtual_size: Option<u64>, can_seek: bool) {
        self.records.lock().unwrap().insert(
            path.to_string(),
            MemRecord {
                data: Arc::new(data.to_vec()),
                hide_size,
                virtual_size,
                can_seek,
                mtime: SystemTime::now(),
            },
        );
    }

    /// Make `download` fail with SizeExceeded above `limit` bytes.
    pub fn set_download_limit(&self, limit: Option<u64>) {
        *self.download_limit.lock().unwrap() = limit;
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    pub fn download_calls(&self) -> u64 {
        self.download_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordEngine for InMemoryEngine {
    async fn list_children(&self, prefix: &str) -> Result<Vec<RecordInfo>, EngineError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, rec)| rec.info(path))
            .collect())
    }

    async fn resolve(&self, path: &str) -> Result<Option<RecordInfo>, EngineError> {
        let records = self.records.lock().unwrap();
        if let Some(rec) = records.get(path) {
            return Ok(Some(rec.info(path)));
        }
        let dir_form = format!("{}/", path.trim_end_matches('/'));
        if records.keys().any(|k| k.starts_with(&dir_form)) {
            return Err(EngineError::Ambiguous(path.to_string()));
        }
        Ok(None)
    }

    async fn download(&self, record: &RecordInfo, target: &Path) -> Result<u64, EngineError> {
        self.download_calls.fetch_add(1, Ordering::Relaxed);
        let rec = self
            .records
            .lock()
            .unwrap()
            .get(&record.path)
            .cloned()
            .ok_or_else(|| EngineError::Backend(format!("no record at {}", record.path)))?;
        let size = rec.size();
        if let Some(limit) = *self.download_limit.lock().unwrap() {
            if size > limit {
                return Err(EngineError::SizeExceeded(size));
            }
        }
        let bytes = rec.read_at(0, size as usize);
        tokio::fs::write(target, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

#[async_trait]
impl StreamTransport for InMemoryEngine {
    fn connect(&self, sink: Arc<dyn ReadSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn open_stream(&self, record: &RecordInfo) -> Result<StreamId, EngineError> {
        if !self.records.lock().unwrap().contains_key(&record.path) {
            return Err(EngineError::Backend(format!("no record at {}", record.path)));
        }
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().unwrap().insert(id, record.path.clone());
        Ok(id)
    }

    async fn read_range(
        &self,
        stream: StreamId,
        read_id: u64,
        offset: u64,
        len: u32,
    ) -> Result<(), EngineError> {
        let path = self
            .streams
            .lock()
            .unwrap()
            .get(&stream)
            .cloned()
            .ok_or(EngineError::UnknownStream(stream))?;
        let rec = self
            .records
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| EngineError::Backend(format!("no record at {path}")))?;
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Backend("no response sink connected".into()))?;
        tokio::spawn(async move {
            sink.deliver(read_id, rec.read_at(offset, len as usize));
        });
        Ok(())
    }

    async fn close_stream(&self, stream: StreamId) -> Result<(), EngineError> {
        self.streams
            .lock()
            .unwrap()
            .remove(&stream)
            .map(|_| ())
            .ok_or(EngineError::UnknownStream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_and_virtual_reads() {
        let engine = InMemoryEngine::new();
        engine.put("/a.txt", b"hello world");
        engine.put_virtual("/big.bin", b"head", 1 << 20);

        let rec = engine.resolve("/a.txt").await.unwrap().unwrap();
        assert_eq!(rec.size, Some(11));

        let big = engine.resolve("/big.bin").await.unwrap().unwrap();
        assert_eq!(big.size, Some(1 << 20));

        // Prefix of several records resolves as "not a single value".
        engine.put("/dir/x", b"x");
        engine.put("/dir/y", b"y");
        assert!(matches!(
            engine.resolve("/dir").await,
            Err(EngineError::Ambiguous(_))
        ));

        let records = engine.records.lock().unwrap();
        let big = records.get("/big.bin").unwrap();
        assert_eq!(big.read_at(0, 4), b"head");
        // Past the held bytes but inside the advertised size: zero-filled.
        assert_eq!(big.read_at(4, 4), vec![0u8; 4]);
        // Past the advertised size: empty.
        assert!(big.read_at(1 << 20, 4).is_empty());
    }

    #[tokio::test]
    async fn test_download_limit() {
        let engine = InMemoryEngine::new();
        engine.put("/a", b"aaaa");
        engine.set_download_limit(Some(2));
        let rec = engine.resolve("/a").await.unwrap().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            engine.download(&rec, &tmp.path().join("a")).await,
            Err(EngineError::SizeExceeded(4))
        ));
    }
}
