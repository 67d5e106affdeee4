//! Local-directory engine backend: serves a host directory as the record
//! namespace. Used by the mount binary and as a mock for integration tests.

use crate::engine::types::{
    EngineError, ReadSink, RecordEngine, RecordInfo, StreamId, StreamTransport,
};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub struct LocalDirEngine {
    root: PathBuf,
    streams: Mutex<HashMap<StreamId, PathBuf>>,
    next_stream: AtomicU64,
    sink: Mutex<Option<Arc<dyn ReadSink>>>,
}

impl LocalDirEngine {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            sink: Mutex::new(None),
        }
    }

    fn fs_path(&self, portable: &str) -> PathBuf {
        self.root.join(portable.trim_start_matches('/'))
    }

    fn portable_path(&self, fs_path: &Path) -> Option<String> {
        let rel = fs_path.strip_prefix(&self.root).ok()?;
        let mut out = String::from("/");
        out.push_str(&rel.to_string_lossy().replace('\\', "/"));
        Some(out)
    }

    async fn record_for(&self, fs_path: &Path) -> Result<Option<RecordInfo>, EngineError> {
        let meta = match fs::metadata(fs_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(None);
        }
        let Some(path) = self.portable_path(fs_path) else {
            return Ok(None);
        };
        Ok(Some(RecordInfo {
            path,
            size: Some(meta.len()),
            last_modified: meta.modified().ok(),
            can_seek: true,
        }))
    }
}

#[async_trait]
impl RecordEngine for LocalDirEngine {
    async fn list_children(&self, prefix: &str) -> Result<Vec<RecordInfo>, EngineError> {
        let start = self.fs_path(prefix);
        match fs::metadata(&start).await {
            Ok(m) if m.is_dir() => {}
            _ => return Ok(Vec::new()),
        }
        // Iterative walk; the namespace is flat so every file below the
        // prefix is a match.
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut rd = fs::read_dir(&dir).await?;
            while let Some(ent) = rd.next_entry().await? {
                let ty = ent.file_type().await?;
                if ty.is_dir() {
                    stack.push(ent.path());
                } else if ty.is_file() {
                    if let Some(rec) = self.record_for(&ent.path()).await? {
                        out.push(rec);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn resolve(&self, path: &str) -> Result<Option<RecordInfo>, EngineError> {
        let fs_path = self.fs_path(path);
        match fs::metadata(&fs_path).await {
            Ok(m) if m.is_dir() => Err(EngineError::Ambiguous(path.to_string())),
            Ok(_) => self.record_for(&fs_path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, record: &RecordInfo, target: &Path) -> Result<u64, EngineError> {
        let src = self.fs_path(&record.path);
        let written = fs::copy(&src, target).await?;
        debug!("downloaded {} ({} bytes)", record.path, written);
        Ok(written)
    }
}

#[async_trait]
impl StreamTransport for LocalDirEngine {
    fn connect(&self, sink: Arc<dyn ReadSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn open_stream(&self, record: &RecordInfo) -> Result<StreamId, EngineError> {
        let fs_path = self.fs_path(&record.path);
        // Fail open-time rather than at the first read.
        fs::metadata(&fs_path).await?;
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().unwrap().insert(id, fs_path);
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
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Backend("no response sink connected".into()))?;
        // The response is delivered out-of-band, keyed by read_id.
        tokio::spawn(async move {
            let mut buf = vec![0u8; len as usize];
            let n = match read_range_at(&path, offset, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("range read {read_id} failed: {e}");
                    0
                }
            };
            buf.truncate(n);
            sink.deliver(read_id, buf);
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

async fn read_range_at(path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ReadSink;
    use std::sync::Mutex as StdMutex;

    struct CollectSink(StdMutex<HashMap<u64, Vec<u8>>>);

    impl ReadSink for CollectSink {
        fn deliver(&self, read_id: u64, bytes: Vec<u8>) {
            self.0.lock().unwrap().insert(read_id, bytes);
        }
    }

    #[tokio::test]
    async fn test_list_resolve_download() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("dir")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello world").unwrap();
        std::fs::write(tmp.path().join("dir/b.txt"), b"beta").unwrap();

        let engine = LocalDirEngine::new(tmp.path());
        let mut all = engine.list_children("/").await.unwrap();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "/a.txt");
        assert_eq!(all[0].size, Some(11));
        assert_eq!(all[1].path, "/dir/b.txt");

        let rec = engine.resolve("/a.txt").await.unwrap().unwrap();
        assert!(rec.can_stream());
        assert!(engine.resolve("/missing").await.unwrap().is_none());
        // A directory prefix is "not a single value".
        assert!(matches!(
            engine.resolve("/dir").await,
            Err(EngineError::Ambiguous(_))
        ));

        let target = tmp.path().join("copy");
        let n = engine.download(&rec, &target).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_stream_range_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello world").unwrap();

        let engine = LocalDirEngine::new(tmp.path());
        let sink = Arc::new(CollectSink(StdMutex::new(HashMap::new())));
        engine.connect(sink.clone());

        let rec = engine.resolve("/a.txt").await.unwrap().unwrap();
        let stream = engine.open_stream(&rec).await.unwrap();
        engine.read_range(stream, 7, 6, 5).await.unwrap();

        // Delivery is asynchronous; poll briefly.
        for _ in 0..50 {
            if sink.0.lock().unwrap().contains_key(&7) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sink.0.lock().unwrap().get(&7).unwrap(), b"world");

        engine.close_stream(stream).await.unwrap();
        assert!(matches!(
            engine.read_range(stream, 8, 0, 1).await,
            Err(EngineError::UnknownStream(_))
        ));
    }
}
