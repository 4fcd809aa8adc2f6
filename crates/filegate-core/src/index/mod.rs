//! Searchable index mirroring the served directory tree.
//!
//! [`PathIndex`] holds one [`IndexDocument`] per filesystem entry below its
//! root. A single read/write lock guards the document set: searches take the
//! shared lock, mutations take the exclusive lock. Callers that change the
//! filesystem run the change and the matching index update inside
//! [`PathIndex::apply`], so the index is only updated after the filesystem
//! call succeeded and concurrent mutations never interleave their updates.
//!
//! Index update failures inside `apply` are logged, never returned: the
//! filesystem change already happened and only [`PathIndex::init`] restores
//! full consistency.

mod query;
mod storage;
mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{FsError, Result};

pub use query::{DEFAULT_PAGE_SIZE, Field, Query};
pub use storage::{BACKUP_DIR_NAME, INDEX_FILE_NAME};
pub use watch::IndexWatcher;

use storage::{Journal, JournalRecord};

/// Buffered index events per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 64;

/// One indexed filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub name: String,
    pub path: String,
    pub parent_path: String,
    pub is_dir: bool,
}

impl IndexDocument {
    /// Builds a document for `path`; `None` if the path is not valid UTF-8.
    pub fn new(path: &Path, is_dir: bool) -> Option<Self> {
        let path_str = path.to_str()?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or(path_str);
        let parent = path.parent().and_then(Path::to_str).unwrap_or("");
        Some(Self {
            name: name.to_string(),
            path: path_str.to_string(),
            parent_path: parent.to_string(),
            is_dir,
        })
    }

    /// Builds a document from a `/`-separated path string.
    pub fn from_path_str(path: &str, is_dir: bool) -> Self {
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        Self {
            name: name.to_string(),
            path: path.to_string(),
            parent_path: if parent.is_empty() && path.starts_with('/') {
                "/".to_string()
            } else {
                parent.to_string()
            },
            is_dir,
        }
    }
}

/// Where the index keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStorage {
    Memory,
    Disk { data_dir: PathBuf },
}

/// Notifications for index observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexEvent {
    /// The index was rebuilt from the live tree.
    Rebuilt { documents: usize },
    /// Documents were added or removed.
    Updated { documents: usize },
}

/// A page of search hits plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub total: usize,
    pub hits: Vec<IndexDocument>,
}

type Documents = BTreeMap<String, IndexDocument>;

/// Keys of the document at `path` and every document below it.
pub(crate) fn subtree_keys(docs: &Documents, path: &str) -> Vec<String> {
    let trimmed = path.trim_end_matches('/');
    let prefix = format!("{trimmed}/");
    let mut keys: Vec<String> = docs
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect();
    if docs.contains_key(trimmed) {
        keys.push(trimmed.to_string());
    }
    keys
}

/// Searchable index of every entry below a root directory.
pub struct PathIndex {
    root: PathBuf,
    docs: RwLock<Documents>,
    journal: Option<Journal>,
    events: broadcast::Sender<IndexEvent>,
}

impl PathIndex {
    /// Creates an empty index over `root`. Call [`PathIndex::init`] to fill it.
    pub fn new(root: impl Into<PathBuf>, storage: IndexStorage) -> Result<Self> {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        let journal = match storage {
            IndexStorage::Memory => None,
            IndexStorage::Disk { data_dir } => Some(
                Journal::open(&data_dir).map_err(|e| FsError::from_io(e, data_dir.display()))?,
            ),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            docs: RwLock::new(BTreeMap::new()),
            journal,
            events,
        })
    }

    /// Creates an in-memory index over `root`.
    pub fn in_memory(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root,
            docs: RwLock::new(BTreeMap::new()),
            journal: None,
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuilds the whole index from the live tree.
    ///
    /// A previous on-disk journal is rotated into the backup directory before
    /// the new snapshot is written.
    pub fn init(&self) -> Result<usize> {
        let started = Instant::now();
        let mut docs = self.docs.write();
        docs.clear();
        let mut records = Vec::new();
        self.insert_tree(&mut docs, &self.root, &mut records)?;
        let count = docs.len();

        if let Some(journal) = &self.journal {
            let persisted = journal
                .rotate()
                .and_then(|_| journal.write_snapshot(docs.values()));
            if let Err(e) = persisted {
                warn!(error = %e, "failed to persist index snapshot");
            }
        }
        drop(docs);

        info!(
            root = %self.root.display(),
            documents = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index rebuilt"
        );
        let _ = self.events.send(IndexEvent::Rebuilt { documents: count });
        Ok(count)
    }

    /// Loads the persisted journal instead of walking the tree.
    ///
    /// Returns the number of documents restored. Memory-only indexes restore
    /// nothing.
    pub fn restore(&self) -> Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let restored = journal
            .replay()
            .map_err(|e| FsError::from_io(e, journal.file_path().display()))?;
        let count = restored.len();
        *self.docs.write() = restored;
        debug!(documents = count, "index restored from journal");
        Ok(count)
    }

    /// Indexes `path`, walking the whole subtree if it is a directory.
    pub fn add_resource(&self, path: &Path) -> Result<usize> {
        self.apply(|txn| txn.try_add_resource(path))
    }

    /// Removes exactly one document. Returns whether it existed.
    pub fn del_resource(&self, path: &Path) -> bool {
        self.apply(|txn| Ok(txn.del_resource(path))).unwrap_or(false)
    }

    /// Removes the document for `path` and every document below it.
    pub fn del_tree(&self, path: &Path) -> usize {
        self.apply(|txn| Ok(txn.del_tree(path))).unwrap_or(0)
    }

    /// Runs `op` while holding the exclusive lock.
    ///
    /// `op` performs the filesystem change and then records the matching
    /// index updates on the transaction. Journal writes and observer
    /// notifications happen once `op` returns.
    pub fn apply<T>(&self, op: impl FnOnce(&mut IndexTxn<'_>) -> Result<T>) -> Result<T> {
        let mut docs = self.docs.write();
        let mut txn = IndexTxn {
            index: self,
            docs: &mut *docs,
            records: Vec::new(),
        };
        let out = op(&mut txn);
        let records = std::mem::take(&mut txn.records);
        if records.is_empty() {
            return out;
        }
        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(&records)
        {
            warn!(error = %e, "failed to append index journal");
        }
        let documents = docs.len();
        drop(docs);
        let _ = self.events.send(IndexEvent::Updated { documents });
        out
    }

    /// Runs `query` and returns the requested page plus the total match count.
    pub fn search(&self, query: &Query) -> SearchResult {
        let docs = self.docs.read();
        let mut total = 0;
        let mut hits = Vec::new();
        let offset = query.offset();
        let size = query.page_size();
        for doc in docs.values().filter(|d| query.matches(d)) {
            if total >= offset && hits.len() < size {
                hits.push(doc.clone());
            }
            total += 1;
        }
        SearchResult { total, hits }
    }

    pub fn count(&self, query: &Query) -> usize {
        self.docs.read().values().filter(|d| query.matches(d)).count()
    }

    /// Returns the first match, or `NotFound`.
    pub fn find_one(&self, query: &Query) -> Result<IndexDocument> {
        self.docs
            .read()
            .values()
            .find(|d| query.matches(d))
            .cloned()
            .ok_or_else(|| FsError::NotFound {
                path: "index document".to_string(),
            })
    }

    pub fn get(&self, path: &Path) -> Option<IndexDocument> {
        let key = path.to_str()?;
        self.docs.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Subscribes to index events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Paths the index never indexes: the root itself and its own storage.
    fn is_storage_path(&self, path: &Path) -> bool {
        self.journal
            .as_ref()
            .is_some_and(|j| path.starts_with(j.data_dir()))
    }

    fn insert_tree(
        &self,
        docs: &mut Documents,
        path: &Path,
        records: &mut Vec<JournalRecord>,
    ) -> Result<usize> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| FsError::from_io(e, path.display()))?;
        if !meta.is_dir() {
            return Ok(self.insert_one(docs, path, false, records));
        }

        let mut added = 0;
        let walker = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.is_storage_path(e.path()));
        for entry in walker {
            match entry {
                Ok(entry) => {
                    added += self.insert_one(docs, entry.path(), entry.file_type().is_dir(), records);
                }
                Err(e) => warn!(error = %e, "skipping unreadable entry during index walk"),
            }
        }
        Ok(added)
    }

    fn insert_one(
        &self,
        docs: &mut Documents,
        path: &Path,
        is_dir: bool,
        records: &mut Vec<JournalRecord>,
    ) -> usize {
        if path == self.root || self.is_storage_path(path) {
            return 0;
        }
        let Some(doc) = IndexDocument::new(path, is_dir) else {
            warn!(path = %path.display(), "skipping non UTF-8 path");
            return 0;
        };
        records.push(JournalRecord::Put { doc: doc.clone() });
        docs.insert(doc.path.clone(), doc);
        1
    }
}

/// Exclusive access to the index for the duration of [`PathIndex::apply`].
pub struct IndexTxn<'a> {
    index: &'a PathIndex,
    docs: &'a mut Documents,
    records: Vec<JournalRecord>,
}

impl IndexTxn<'_> {
    /// Indexes `path` (recursively for directories); failures are logged.
    pub fn add_resource(&mut self, path: &Path) -> usize {
        match self.try_add_resource(path) {
            Ok(added) => added,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "index update failed after filesystem change");
                0
            }
        }
    }

    fn try_add_resource(&mut self, path: &Path) -> Result<usize> {
        let added = self.index.insert_tree(self.docs, path, &mut self.records)?;
        debug!(path = %path.display(), added, "indexed resource");
        Ok(added)
    }

    /// Removes exactly one document.
    pub fn del_resource(&mut self, path: &Path) -> bool {
        let Some(key) = path.to_str() else {
            return false;
        };
        let removed = self.docs.remove(key).is_some();
        if removed {
            self.records.push(JournalRecord::Delete { path: key.to_string() });
        }
        removed
    }

    /// Removes the document at `path` and every document below it.
    pub fn del_tree(&mut self, path: &Path) -> usize {
        let Some(key) = path.to_str() else {
            return 0;
        };
        let keys = subtree_keys(self.docs, key);
        for k in &keys {
            self.docs.remove(k);
        }
        if !keys.is_empty() {
            self.records.push(JournalRecord::DeleteTree { path: key.to_string() });
        }
        debug!(path = %path.display(), removed = keys.len(), "removed index subtree");
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> (tempfile::TempDir, PathIndex) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/reports")).unwrap();
        fs::write(dir.path().join("docs/a.txt"), b"a").unwrap();
        fs::write(dir.path().join("docs/reports/q1.pdf"), b"q1").unwrap();
        fs::write(dir.path().join("top.md"), b"top").unwrap();
        let index = PathIndex::in_memory(dir.path());
        (dir, index)
    }

    #[test]
    fn init_indexes_everything_but_root() {
        let (_dir, index) = tree();
        assert_eq!(index.init().unwrap(), 5);
        assert!(index.get(index.root()).is_none());
    }

    #[test]
    fn document_fields() {
        let (_dir, index) = tree();
        index.init().unwrap();
        let path = index.root().join("docs/reports/q1.pdf");
        let doc = index.get(&path).unwrap();
        assert_eq!(doc.name, "q1.pdf");
        assert_eq!(doc.parent_path, index.root().join("docs/reports").to_str().unwrap());
        assert!(!doc.is_dir);
    }

    #[test]
    fn del_resource_removes_exactly_one() {
        let (_dir, index) = tree();
        index.init().unwrap();
        assert!(index.del_resource(&index.root().join("docs")));
        assert_eq!(index.len(), 4);
        assert!(!index.del_resource(&index.root().join("docs")));
    }

    #[test]
    fn del_tree_respects_path_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::create_dir_all(dir.path().join("a/b-c")).unwrap();
        fs::write(dir.path().join("a/b/x"), b"").unwrap();
        let index = PathIndex::in_memory(dir.path());
        index.init().unwrap();

        assert_eq!(index.del_tree(&index.root().join("a/b")), 2);
        assert!(index.get(&index.root().join("a/b-c")).is_some());
    }

    #[test]
    fn added_directory_is_searchable_until_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let index = PathIndex::in_memory(dir.path());
        index.init().unwrap();

        let upload = index.root().join("upload");
        fs::create_dir(&upload).unwrap();
        for name in ["a.bin", "b.bin", "c.bin"] {
            fs::write(upload.join(name), b"x").unwrap();
        }
        assert_eq!(index.add_resource(&upload).unwrap(), 4);

        let children = Query::new().term(Field::ParentPath, upload.to_str().unwrap());
        assert_eq!(index.count(&children), 3);

        assert_eq!(index.del_tree(&upload), 4);
        assert_eq!(index.count(&children), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn search_paginates_in_path_order() {
        let (_dir, index) = tree();
        index.init().unwrap();
        let first = index.search(&Query::new().page(1, 2));
        let second = index.search(&Query::new().page(2, 2));
        let third = index.search(&Query::new().page(3, 2));
        assert_eq!(first.total, 5);
        assert_eq!(first.hits.len(), 2);
        assert_eq!(second.hits.len(), 2);
        assert_eq!(third.hits.len(), 1);
        assert!(first.hits[1].path < second.hits[0].path);
    }

    #[test]
    fn find_one_reports_not_found() {
        let (_dir, index) = tree();
        index.init().unwrap();
        let q = Query::new().term(Field::Name, "missing");
        assert!(matches!(index.find_one(&q), Err(FsError::NotFound { .. })));
        let q = Query::new().term(Field::Name, "top.md");
        assert_eq!(index.find_one(&q).unwrap().name, "top.md");
    }

    #[test]
    fn add_resource_of_missing_path_fails() {
        let (_dir, index) = tree();
        let err = index.add_resource(&index.root().join("ghost")).unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
    }

    #[test]
    fn apply_logs_index_failures_without_failing_the_operation() {
        let (_dir, index) = tree();
        let out = index.apply(|txn| {
            let added = txn.add_resource(Path::new("/definitely/not/here"));
            Ok(added)
        });
        assert_eq!(out.unwrap(), 0);
    }

    #[tokio::test]
    async fn observers_receive_events() {
        let (_dir, index) = tree();
        let mut first = index.subscribe();
        let mut second = index.subscribe();

        index.init().unwrap();
        index.del_resource(&index.root().join("top.md"));

        assert_eq!(first.recv().await.unwrap(), IndexEvent::Rebuilt { documents: 5 });
        assert_eq!(first.recv().await.unwrap(), IndexEvent::Updated { documents: 4 });
        assert_eq!(second.recv().await.unwrap(), IndexEvent::Rebuilt { documents: 5 });
    }

    #[test]
    fn disk_storage_rotates_and_restores() {
        let (dir, _) = tree();
        let data = tempfile::tempdir().unwrap();
        let storage = IndexStorage::Disk {
            data_dir: data.path().to_path_buf(),
        };

        let index = PathIndex::new(dir.path(), storage.clone()).unwrap();
        index.init().unwrap();
        index.del_tree(&index.root().join("docs"));
        index.init().unwrap();
        assert!(data.path().join(BACKUP_DIR_NAME).read_dir().unwrap().next().is_some());

        index.del_tree(&index.root().join("docs"));
        let reopened = PathIndex::new(dir.path(), storage).unwrap();
        assert_eq!(reopened.restore().unwrap(), 1);
    }

    #[test]
    fn storage_inside_root_is_not_indexed() {
        let (dir, _) = tree();
        let data_dir = dir.path().join(".index");
        let index = PathIndex::new(
            dir.path(),
            IndexStorage::Disk {
                data_dir: data_dir.clone(),
            },
        )
        .unwrap();
        index.init().unwrap();
        assert_eq!(index.len(), 5);
    }
}
