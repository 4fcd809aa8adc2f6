//! On-disk persistence for the path index.
//!
//! The index is kept as a JSON-lines journal. [`Journal::write_snapshot`]
//! writes one `put` record per document after a rebuild; every later mutation
//! appends `put`, `delete` or `delete_tree` records. Before a snapshot the
//! previous journal is moved into a timestamped backup directory rather than
//! overwritten.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{IndexDocument, subtree_keys};

/// Journal file name inside the data directory.
pub const INDEX_FILE_NAME: &str = "filegate.index";

/// Directory (inside the data directory) holding rotated journals.
pub const BACKUP_DIR_NAME: &str = "index_bak";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    Put { doc: IndexDocument },
    Delete { path: String },
    DeleteTree { path: String },
}

pub(crate) struct Journal {
    data_dir: PathBuf,
    file: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Journal {
    pub(crate) fn open(data_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        let data_dir = fs::canonicalize(data_dir)?;
        Ok(Self {
            file: data_dir.join(INDEX_FILE_NAME),
            data_dir,
            writer: Mutex::new(None),
        })
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub(crate) fn file_path(&self) -> &Path {
        &self.file
    }

    /// Moves the current journal into the backup directory.
    ///
    /// Returns the backup location, or `None` if there was no journal.
    pub(crate) fn rotate(&self) -> io::Result<Option<PathBuf>> {
        let mut writer = self.writer.lock();
        if let Some(mut w) = writer.take() {
            w.flush()?;
        }
        if !self.file.exists() {
            return Ok(None);
        }
        let backup_dir = self.data_dir.join(BACKUP_DIR_NAME);
        fs::create_dir_all(&backup_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
        let backup = backup_dir.join(format!("{INDEX_FILE_NAME}.{stamp}"));
        fs::rename(&self.file, &backup)?;
        tracing::info!(backup = %backup.display(), "rotated previous index");
        Ok(Some(backup))
    }

    /// Starts a fresh journal containing every document.
    pub(crate) fn write_snapshot<'a>(
        &self,
        docs: impl IntoIterator<Item = &'a IndexDocument>,
    ) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let mut w = BufWriter::new(File::create(&self.file)?);
        for doc in docs {
            write_record(&mut w, &JournalRecord::Put { doc: doc.clone() })?;
        }
        w.flush()?;
        *writer = Some(w);
        Ok(())
    }

    pub(crate) fn append(&self, records: &[JournalRecord]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.file)?;
            *writer = Some(BufWriter::new(file));
        }
        let Some(w) = writer.as_mut() else {
            return Ok(());
        };
        for record in records {
            write_record(w, record)?;
        }
        w.flush()
    }

    /// Rebuilds the document set by replaying the journal.
    pub(crate) fn replay(&self) -> io::Result<BTreeMap<String, IndexDocument>> {
        let mut docs = BTreeMap::new();
        let file = match File::open(&self.file) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(docs),
            Err(e) => return Err(e),
        };
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(JournalRecord::Put { doc }) => {
                    docs.insert(doc.path.clone(), doc);
                }
                Ok(JournalRecord::Delete { path }) => {
                    docs.remove(&path);
                }
                Ok(JournalRecord::DeleteTree { path }) => {
                    for key in subtree_keys(&docs, &path) {
                        docs.remove(&key);
                    }
                }
                Err(e) => {
                    // A torn final line after a crash is expected
                    tracing::warn!(line = lineno + 1, error = %e, "skipping corrupt index record");
                }
            }
        }
        Ok(docs)
    }
}

fn write_record(w: &mut impl Write, record: &JournalRecord) -> io::Result<()> {
    serde_json::to_writer(&mut *w, record)?;
    w.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, is_dir: bool) -> IndexDocument {
        IndexDocument::from_path_str(path, is_dir)
    }

    #[test]
    fn snapshot_then_append_replays() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();

        let docs = [doc("/r/a", true), doc("/r/a/1.txt", false), doc("/r/b.txt", false)];
        journal.write_snapshot(docs.iter()).unwrap();
        journal
            .append(&[
                JournalRecord::DeleteTree { path: "/r/a".into() },
                JournalRecord::Put { doc: doc("/r/c", true) },
                JournalRecord::Delete { path: "/r/b.txt".into() },
            ])
            .unwrap();

        let replayed = journal.replay().unwrap();
        let keys: Vec<_> = replayed.keys().cloned().collect();
        assert_eq!(keys, vec!["/r/c".to_string()]);
    }

    #[test]
    fn rotate_moves_previous_journal_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        assert!(journal.rotate().unwrap().is_none());

        journal.write_snapshot([doc("/r/x", false)].iter()).unwrap();
        let backup = journal.rotate().unwrap().expect("journal existed");

        assert!(backup.starts_with(dir.path().join(BACKUP_DIR_NAME)));
        assert!(backup.exists());
        assert!(!journal.file_path().exists());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        journal.write_snapshot([doc("/r/x", false)].iter()).unwrap();
        let mut raw = OpenOptions::new().append(true).open(journal.file_path()).unwrap();
        raw.write_all(b"{\"op\":\"put\",\"doc\":{\"na").unwrap();

        let replayed = journal.replay().unwrap();
        assert_eq!(replayed.len(), 1);
    }
}
