//! Archive extraction with shared progress streams.
//!
//! [`ExtractionHub::unarchive`] guarantees at most one running extraction per
//! archive path. The first caller claims the path and starts the job on the
//! blocking pool; every caller, including the first, gets its own
//! [`ProgressStream`] over the job's [`Broadcaster`]. Streams always end with
//! a terminal `done` or `error` event.
//!
//! A successful job stays joinable for a short retention window after it
//! finished, so a caller arriving late is replayed its `done` event instead
//! of starting a second extraction.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use filegate_common::TtlMap;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{FsError, Result};
use crate::index::PathIndex;

/// Response headers for a server-sent-events progress stream.
pub const SSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];

/// How long a finished extraction replays its `done` event to late callers.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// Bytes read from the front of an archive to identify its format.
const HEADER_LEN: u64 = 512;

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The entry currently being written.
    Message(String),
    /// Terminal success.
    Done(String),
    /// Terminal failure.
    Error(String),
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Message(s) | Self::Done(s) | Self::Error(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message(_))
    }

    /// Renders the event as a server-sent-events frame.
    pub fn to_sse(&self) -> String {
        let mut frame = format!("event: {}\n", self.kind());
        for line in self.text().split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

/// One entry handed to the visitor by an [`ArchiveFormat`].
pub struct ArchiveEntry<'a> {
    /// Name as stored in the archive, not yet sanitized.
    pub name: String,
    pub is_dir: bool,
    pub reader: &'a mut dyn Read,
}

pub type EntryVisitor<'v> = dyn FnMut(ArchiveEntry<'_>) -> io::Result<()> + 'v;

/// A container format the hub can extract.
pub trait ArchiveFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this format handles a file with this name and leading bytes.
    fn matches(&self, file_name: &str, header: &[u8]) -> bool;

    /// Streams every entry of `archive` to `visit`, one at a time.
    ///
    /// An error returned by `visit` aborts the walk and is passed through.
    fn entries(&self, archive: &Path, visit: &mut EntryVisitor<'_>) -> io::Result<()>;
}

pub struct ZipFormat;

impl ArchiveFormat for ZipFormat {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn matches(&self, file_name: &str, header: &[u8]) -> bool {
        header.starts_with(b"PK\x03\x04") || file_name.to_ascii_lowercase().ends_with(".zip")
    }

    fn entries(&self, archive: &Path, visit: &mut EntryVisitor<'_>) -> io::Result<()> {
        let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(io::Error::other)?;
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(io::Error::other)?;
            let name = file.name().to_string();
            let is_dir = file.is_dir();
            visit(ArchiveEntry {
                name,
                is_dir,
                reader: &mut file,
            })?;
        }
        Ok(())
    }
}

pub struct TarFormat;

impl ArchiveFormat for TarFormat {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn matches(&self, file_name: &str, header: &[u8]) -> bool {
        header.get(257..262) == Some(b"ustar".as_slice())
            || file_name.to_ascii_lowercase().ends_with(".tar")
    }

    fn entries(&self, archive: &Path, visit: &mut EntryVisitor<'_>) -> io::Result<()> {
        visit_tar(File::open(archive)?, visit)
    }
}

pub struct TarGzFormat;

impl ArchiveFormat for TarGzFormat {
    fn name(&self) -> &'static str {
        "tar.gz"
    }

    fn matches(&self, file_name: &str, header: &[u8]) -> bool {
        let lower = file_name.to_ascii_lowercase();
        header.starts_with(&[0x1f, 0x8b]) && (lower.ends_with(".tar.gz") || lower.ends_with(".tgz"))
    }

    fn entries(&self, archive: &Path, visit: &mut EntryVisitor<'_>) -> io::Result<()> {
        visit_tar(GzDecoder::new(File::open(archive)?), visit)
    }
}

fn visit_tar(reader: impl Read, visit: &mut EntryVisitor<'_>) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let name = entry.path()?.to_string_lossy().into_owned();
        if !kind.is_dir() && !kind.is_file() {
            debug!(entry = %name, "skipping special tar entry");
            continue;
        }
        visit(ArchiveEntry {
            name,
            is_dir: kind.is_dir(),
            reader: &mut entry,
        })?;
    }
    Ok(())
}

/// Built-in formats, most specific first.
pub fn default_formats() -> Vec<Arc<dyn ArchiveFormat>> {
    vec![Arc::new(TarGzFormat), Arc::new(ZipFormat), Arc::new(TarFormat)]
}

/// A progress stream that always ends with a terminal event.
pub struct ProgressStream {
    inner: Subscription<ProgressEvent>,
    finished: bool,
}

impl ProgressStream {
    /// Next event, or `None` after the terminal event was delivered.
    ///
    /// A job that vanished without a terminal event yields a synthetic
    /// `error` "extraction aborted".
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        let event = match self.inner.recv().await {
            Some(event) => event,
            None => ProgressEvent::Error("extraction aborted".to_string()),
        };
        self.finished = event.is_terminal();
        Some(event)
    }

    /// Like [`ProgressStream::next`], but stops listening when `cancel`
    /// fires. The job itself keeps running for other subscribers.
    pub async fn next_or_cancel(&mut self, cancel: &CancellationToken) -> Option<ProgressEvent> {
        tokio::select! {
            event = self.next() => event,
            () = cancel.cancelled() => None,
        }
    }

    /// Drains the stream up to and including the terminal event.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

struct Job {
    progress: Arc<Broadcaster<ProgressEvent>>,
    cancel: CancellationToken,
}

/// Runs extractions, at most one per archive path.
pub struct ExtractionHub {
    jobs: Mutex<HashMap<PathBuf, Job>>,
    finished: TtlMap<PathBuf, Arc<Broadcaster<ProgressEvent>>>,
    formats: Vec<Arc<dyn ArchiveFormat>>,
    index: Arc<PathIndex>,
}

impl ExtractionHub {
    pub fn new(index: Arc<PathIndex>) -> Self {
        Self::with_formats(index, default_formats())
    }

    pub fn with_formats(index: Arc<PathIndex>, formats: Vec<Arc<dyn ArchiveFormat>>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            finished: TtlMap::new(DEFAULT_RETENTION),
            formats,
            index,
        }
    }

    /// Replaces how long successful jobs stay joinable after finishing.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.finished = TtlMap::new(retention);
        self
    }

    pub fn register_format(&mut self, format: Arc<dyn ArchiveFormat>) {
        self.formats.push(format);
    }

    /// Extracts `archive` next to itself, or joins the running extraction.
    ///
    /// `cancel` only governs a job this call starts. Must be called from
    /// within a tokio runtime.
    pub fn unarchive(self: &Arc<Self>, archive: PathBuf, cancel: &CancellationToken) -> ProgressStream {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(&archive) {
            debug!(archive = %archive.display(), "joining running extraction");
            return ProgressStream {
                inner: job.progress.subscribe(),
                finished: false,
            };
        }
        if let Some(progress) = self.finished.get(&archive) {
            debug!(archive = %archive.display(), "replaying finished extraction");
            return ProgressStream {
                inner: progress.subscribe(),
                finished: false,
            };
        }

        let progress = Arc::new(Broadcaster::new());
        let job_cancel = cancel.child_token();
        let subscription = progress.subscribe();
        jobs.insert(
            archive.clone(),
            Job {
                progress: Arc::clone(&progress),
                cancel: job_cancel.clone(),
            },
        );
        drop(jobs);

        info!(archive = %archive.display(), "starting extraction");
        let hub = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut guard = JobGuard {
                hub: &hub,
                archive: &archive,
                progress: &progress,
                retain: false,
            };
            let terminal = hub.run_job(&archive, &progress, &job_cancel);
            guard.retain = matches!(terminal, ProgressEvent::Done(_));
            progress.finish(terminal);
            drop(guard);
        });

        ProgressStream {
            inner: subscription,
            finished: false,
        }
    }

    /// Cancels the running extraction of `archive`, if any.
    pub fn cancel(&self, archive: &Path) -> bool {
        match self.jobs.lock().get(archive) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, archive: &Path) -> bool {
        self.jobs.lock().contains_key(archive)
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    fn run_job(
        &self,
        archive: &Path,
        progress: &Broadcaster<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> ProgressEvent {
        match self.extract(archive, progress, cancel) {
            Ok((destination, entries)) => {
                progress.publish(ProgressEvent::Message("updating index".to_string()));
                if let Err(e) = self.index.add_resource(&destination) {
                    warn!(path = %destination.display(), error = %e, "failed to index extracted files");
                }
                info!(archive = %archive.display(), entries, "extraction finished");
                ProgressEvent::Done(format!("extracted {entries} entries"))
            }
            Err(FsError::ExtractionCancelled) => {
                info!(archive = %archive.display(), "extraction cancelled");
                ProgressEvent::Error(FsError::ExtractionCancelled.to_string())
            }
            Err(FsError::AlreadyExists { .. }) => {
                ProgressEvent::Error("destination already exists".to_string())
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "extraction failed");
                let reason = if matches!(e, FsError::ExtractionFailed { .. }) {
                    e.to_string()
                } else {
                    FsError::ExtractionFailed { reason: e.to_string() }.to_string()
                };
                ProgressEvent::Error(reason)
            }
        }
    }

    fn extract(
        &self,
        archive: &Path,
        progress: &Broadcaster<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, usize)> {
        let file_name = archive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FsError::InvalidInput(format!("not an archive: {}", archive.display())))?;
        let header = read_header(archive).map_err(|e| FsError::from_io(e, file_name))?;
        let format = self
            .formats
            .iter()
            .find(|f| f.matches(file_name, &header))
            .ok_or_else(|| FsError::ExtractionFailed {
                reason: format!("unsupported archive format: {file_name}"),
            })?;

        let stem = archive_stem(file_name);
        let destination = archive.parent().unwrap_or_else(|| Path::new("")).join(stem);
        if destination.exists() {
            return Err(FsError::AlreadyExists {
                path: stem.to_string(),
            });
        }
        fs::create_dir(&destination).map_err(|e| FsError::from_io(e, stem))?;
        debug!(format = format.name(), destination = %destination.display(), "extracting");

        let mut entries = 0usize;
        let walked = format.entries(archive, &mut |entry| {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let Some(relative) = sanitize_entry_name(&entry.name) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry escapes destination: {}", entry.name),
                ));
            };
            if relative.is_empty() {
                return Ok(());
            }
            let target = destination.join(&relative);
            if entry.is_dir {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = OpenOptions::new().write(true).create_new(true).open(&target)?;
                io::copy(
                    &mut CancelReader {
                        inner: entry.reader,
                        cancel,
                    },
                    &mut out,
                )?;
            }
            entries += 1;
            progress.publish(ProgressEvent::Message(format!("{stem}/{relative}")));
            Ok(())
        });

        if let Err(e) = walked {
            if let Err(cleanup) = fs::remove_dir_all(&destination) {
                warn!(path = %destination.display(), error = %cleanup, "failed to remove partial extraction");
            }
            if cancel.is_cancelled() {
                return Err(FsError::ExtractionCancelled);
            }
            return Err(FsError::ExtractionFailed {
                reason: e.to_string(),
            });
        }
        Ok((destination, entries))
    }
}

/// Closes the broadcaster and releases the claim, even if the job panics.
struct JobGuard<'a> {
    hub: &'a ExtractionHub,
    archive: &'a Path,
    progress: &'a Broadcaster<ProgressEvent>,
    /// Keep the finished job joinable for late callers.
    retain: bool,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.progress.close();
        let mut jobs = self.hub.jobs.lock();
        if let Some(job) = jobs.remove(self.archive)
            && self.retain
        {
            self.hub.finished.insert(self.archive.to_path_buf(), job.progress);
        }
    }
}

struct CancelReader<'a, 'r> {
    inner: &'r mut dyn Read,
    cancel: &'a CancellationToken,
}

impl Read for CancelReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.inner.read(buf)
    }
}

fn cancelled() -> io::Error {
    io::Error::other("extraction cancelled")
}

fn read_header(archive: &Path) -> io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    File::open(archive)?.take(HEADER_LEN).read_to_end(&mut header)?;
    Ok(header)
}

/// Base name up to its first `.`, skipping leading dots.
fn archive_stem(file_name: &str) -> &str {
    file_name
        .split('.')
        .find(|part| !part.is_empty())
        .unwrap_or(file_name)
}

/// Normalizes an entry name to a `/`-joined relative path.
///
/// Returns `None` for names that are absolute or climb out with `..`. An
/// empty result denotes the archive root itself.
fn sanitize_entry_name(name: &str) -> Option<String> {
    let name = name.replace('\\', "/");
    if name.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for component in Path::new(&name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.join("/"))
}
