//! Directory emulation over the engine's flat namespace.
//!
//! Listings are built once per prefix and kept for the mount's lifetime;
//! the backing record set is treated as immutable while mounted. Attribute
//! metadata is harvested as a side effect of listing so that subsequent
//! stat calls are free.

use crate::engine::types::{EngineError, RecordEngine, RecordInfo};
use crate::vfs::error::FsError;
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Outcome of resolving a single path against the engine.
#[derive(Clone, Debug)]
pub enum Resolved {
    Record(RecordInfo),
    /// The path is a prefix of deeper records, not a record itself.
    Directory,
}

pub struct DirectoryIndex<E> {
    engine: Arc<E>,
    /// Normalized prefix (trailing separator) -> ordered child names.
    listings: Mutex<HashMap<String, Arc<Vec<String>>>>,
    /// Prefixes known to denote a directory even though no record exactly
    /// matches them. Append-only.
    known_dirs: Mutex<HashSet<String>>,
    /// Attribute metadata by portable path. Unknown-size records are
    /// deliberately absent so they always force a fresh resolution.
    attrs: Mutex<HashMap<String, RecordInfo>>,
}

/// Normalize a path to directory form: trailing separator, root stays "/".
pub fn dir_form(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Parent directory of a normalized absolute path.
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(n) => path[..n].to_string(),
    }
}

impl<E: RecordEngine> DirectoryIndex<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            listings: Mutex::new(HashMap::new()),
            known_dirs: Mutex::new(HashSet::new()),
            attrs: Mutex::new(HashMap::new()),
        }
    }

    /// Ordered immediate children of `path` (file and directory names, no
    /// synthetic entries). One engine query per prefix, memoized.
    pub async fn list_entries(&self, path: &str) -> Result<Arc<Vec<String>>, FsError> {
        let prefix = dir_form(path);
        if let Some(listing) = self.listings.lock().unwrap().get(&prefix) {
            return Ok(listing.clone());
        }

        let records = match self.engine.list_children(&prefix).await {
            Ok(records) => records,
            // "Not a single value": the prefix is a directory, just one the
            // engine could not enumerate as a plain listing.
            Err(EngineError::Ambiguous(_)) => {
                self.note_directory(&prefix);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = BTreeSet::new();
        for record in &records {
            let Some(rel) = record.path.strip_prefix(&prefix) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            match rel.split_once('/') {
                // Direct file child; keep its attributes unless the size is
                // unknown, which must force a fresh resolution later.
                None => {
                    names.insert(rel.to_string());
                    if record.size.is_some() {
                        self.attrs
                            .lock()
                            .unwrap()
                            .insert(record.path.clone(), record.clone());
                    }
                }
                // Nested descendant; only the first segment is our child.
                Some((first, _)) => {
                    names.insert(first.to_string());
                    self.note_directory(&format!("{prefix}{first}"));
                }
            }
        }
        if !names.is_empty() {
            // Listing this prefix yielded matches, so the prefix itself is a
            // directory.
            self.note_directory(&prefix);
        }

        let listing = Arc::new(names.into_iter().collect::<Vec<_>>());
        debug!("listed {prefix}: {} children", listing.len());
        // Races populate the same content; last writer wins.
        self.listings
            .lock()
            .unwrap()
            .insert(prefix, listing.clone());
        Ok(listing)
    }

    /// Attribute lookup: cache, then the parent listing's side effects, then
    /// a point query.
    pub async fn resolve_attributes(&self, path: &str) -> Result<Option<Resolved>, FsError> {
        if let Some(record) = self.cached_attrs(path) {
            return Ok(Some(Resolved::Record(record)));
        }
        self.list_entries(&parent_of(path)).await?;
        if let Some(record) = self.cached_attrs(path) {
            return Ok(Some(Resolved::Record(record)));
        }
        match self.engine.resolve(path).await {
            Ok(Some(record)) => {
                if record.size.is_some() {
                    self.attrs
                        .lock()
                        .unwrap()
                        .insert(record.path.clone(), record.clone());
                }
                Ok(Some(Resolved::Record(record)))
            }
            Ok(None) => Ok(None),
            Err(EngineError::Ambiguous(_)) => {
                self.note_directory(path);
                Ok(Some(Resolved::Directory))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn cached_attrs(&self, path: &str) -> Option<RecordInfo> {
        self.attrs.lock().unwrap().get(path).cloned()
    }

    /// Whether `path` is known to denote a directory. Non-empty listings
    /// record their own prefix here, so this covers both the listing cache
    /// and nested-descendant inference; an empty memoized listing is not
    /// directory evidence.
    pub fn is_known_dir(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        let normalized = path.trim_end_matches('/');
        self.known_dirs.lock().unwrap().contains(normalized)
    }

    fn note_directory(&self, path: &str) {
        let normalized = path.trim_end_matches('/');
        if normalized.is_empty() {
            return;
        }
        self.known_dirs
            .lock()
            .unwrap()
            .insert(normalized.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::InMemoryEngine;

    fn engine() -> Arc<InMemoryEngine> {
        let e = Arc::new(InMemoryEngine::new());
        e.put("/a.txt", b"hello world");
        e.put("/dir/b.txt", b"beta!");
        e.put("/dir/sub/c.txt", b"c");
        e.put_unknown_size("/nosize.bin", b"1234567");
        e
    }

    #[tokio::test]
    async fn test_list_partitions_children() {
        let e = engine();
        let index = DirectoryIndex::new(e.clone());
        let root = index.list_entries("/").await.unwrap();
        assert_eq!(root.as_slice(), ["a.txt", "dir", "nosize.bin"]);
        assert!(index.is_known_dir("/dir"));
        assert!(!index.is_known_dir("/a.txt"));

        // Attributes harvested for known-size files only.
        assert!(index.cached_attrs("/a.txt").is_some());
        assert!(index.cached_attrs("/nosize.bin").is_none());

        // Memoized: a second listing issues no further query.
        let calls = e.list_calls();
        let again = index.list_entries("/").await.unwrap();
        assert_eq!(again.as_slice(), root.as_slice());
        assert_eq!(e.list_calls(), calls);
    }

    #[tokio::test]
    async fn test_nested_listing() {
        let index = DirectoryIndex::new(engine());
        let dir = index.list_entries("/dir").await.unwrap();
        assert_eq!(dir.as_slice(), ["b.txt", "sub"]);
        assert!(index.is_known_dir("/dir/sub"));
    }

    #[tokio::test]
    async fn test_resolve_attributes_paths() {
        let index = DirectoryIndex::new(engine());
        // Miss -> parent listing populates the cache.
        match index.resolve_attributes("/dir/b.txt").await.unwrap() {
            Some(Resolved::Record(r)) => assert_eq!(r.size, Some(5)),
            other => panic!("unexpected: {other:?}"),
        }
        // Unknown-size records resolve through the point query every time.
        match index.resolve_attributes("/nosize.bin").await.unwrap() {
            Some(Resolved::Record(r)) => assert_eq!(r.size, None),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(index.cached_attrs("/nosize.bin").is_none());
        // Ambiguous point query is directory evidence.
        match index.resolve_attributes("/dir/sub").await.unwrap() {
            Some(Resolved::Directory) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(index.resolve_attributes("/gone").await.unwrap().is_none());
    }

    #[test]
    fn test_dir_form_and_parent() {
        assert_eq!(dir_form("/"), "/");
        assert_eq!(dir_form("/a"), "/a/");
        assert_eq!(dir_form("/a/"), "/a/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
    }
}
