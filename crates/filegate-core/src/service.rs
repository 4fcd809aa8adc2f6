//! Transport-agnostic file service.
//!
//! [`FileService`] owns the process-wide pieces (index, registries,
//! extraction hub) and exposes the operations an HTTP surface needs. Every
//! per-request call takes the caller's [`VirtualFs`], so authorization is
//! always enforced by the same code path the FTP surface uses.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filegate_common::SweeperHandle;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::authz::{Action, Authorizer, Identity, RoleStore};
use crate::config::{Config, StorageKind};
use crate::error::{FsError, Result};
use crate::extract::{ExtractionHub, ProgressStream};
use crate::index::{IndexEvent, IndexStorage, IndexWatcher, PathIndex};
use crate::links::DownloadLinkRegistry;
use crate::rate_limit::{Limited, RateLimiterRegistry};
use crate::session::{AuditSink, CredentialStore, SessionManager, TokenIssuer};
use crate::vfs::{DirEntry, FsContext, SearchPage, VirtualFs};
use crate::vpath;

/// How often the link and limiter registries are swept.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// A minted download link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadTicket {
    pub id: u64,
    pub url: String,
}

/// A rate-limited download body.
pub struct Download {
    pub file_name: String,
    pub size: u64,
    pub body: Limited<Box<dyn AsyncRead + Send + Unpin>>,
}

pub struct FileService {
    config: Config,
    index: Arc<PathIndex>,
    ctx: Arc<FsContext>,
    limiters: Arc<RateLimiterRegistry>,
    links: DownloadLinkRegistry,
    extraction: Arc<ExtractionHub>,
    issuer: TokenIssuer,
    watcher: Option<IndexWatcher>,
    _sweepers: Vec<SweeperHandle>,
}

impl FileService {
    /// Builds the service. The index starts empty; call
    /// [`FileService::init_index`] or [`FileService::restore_index`].
    pub fn new(
        config: Config,
        authorizer: Arc<dyn Authorizer>,
        roles: Arc<dyn RoleStore>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| FsError::InvalidInput(e.to_string()))?;
        let storage = match config.index.storage {
            StorageKind::Memory => IndexStorage::Memory,
            StorageKind::Disk => IndexStorage::Disk {
                data_dir: config.data_dir(),
            },
        };
        let index = Arc::new(PathIndex::new(&config.root, storage)?);
        let limiters = Arc::new(RateLimiterRegistry::new(
            config.limits.limiter_idle_ttl,
            config.limits.chunk_size,
        ));
        let ctx = Arc::new(FsContext::new(
            Arc::clone(&index),
            authorizer,
            roles,
            Arc::clone(&limiters),
            config.trash_dir.clone(),
            config.limits.role_rate_ttl,
        ));
        let links =
            DownloadLinkRegistry::with_url_prefix(config.links.ttl, config.links.url_prefix.clone());
        let extraction = Arc::new(ExtractionHub::new(Arc::clone(&index)));
        let issuer = TokenIssuer::new(config.session.jwt_secret.as_bytes(), config.session.token_ttl);

        let mut sweepers = Vec::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            sweepers.push(limiters.spawn_sweeper(SWEEP_INTERVAL));
            sweepers.extend(links.spawn_sweepers(SWEEP_INTERVAL));
        }

        info!(root = %index.root().display(), storage = ?config.index.storage, "file service ready");
        Ok(Self {
            config,
            index,
            ctx,
            limiters,
            links,
            extraction,
            issuer,
            watcher: None,
            _sweepers: sweepers,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<PathIndex> {
        &self.index
    }

    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn links(&self) -> &DownloadLinkRegistry {
        &self.links
    }

    pub fn extraction(&self) -> &Arc<ExtractionHub> {
        &self.extraction
    }

    /// Issuer for the tokens download links carry.
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Rebuilds the index from disk and starts the watcher if configured.
    pub async fn init_index(&mut self) -> Result<usize> {
        let count = self.rebuild().await?;
        if self.config.index.watch && self.watcher.is_none() {
            self.watcher = Some(self.index.watch()?);
        }
        Ok(count)
    }

    /// Loads the persisted index instead of walking the tree.
    pub fn restore_index(&self) -> Result<usize> {
        self.index.restore()
    }

    async fn rebuild(&self) -> Result<usize> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.init())
            .await
            .map_err(|e| FsError::collaborator("index rebuild task", e))?
    }

    /// Filesystem view for `identity`.
    pub fn vfs(&self, identity: Identity) -> VirtualFs {
        VirtualFs::new(Arc::clone(&self.ctx), identity)
    }

    /// FTP session manager sharing this service's filesystem state.
    pub fn session_manager(
        &self,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
    ) -> SessionManager {
        SessionManager::new(
            Arc::clone(&self.ctx),
            credentials,
            audit,
            self.config.admin_role.clone(),
            &self.config.session,
        )
    }

    pub async fn list(&self, fs: &VirtualFs, path: &str) -> Result<Vec<DirEntry>> {
        fs.list(path).await
    }

    pub async fn mkdir(&self, fs: &VirtualFs, path: &str) -> Result<()> {
        fs.mkdir_all(path).await
    }

    pub async fn search(
        &self,
        fs: &VirtualFs,
        dir: &str,
        pattern: &str,
        page: usize,
        size: usize,
    ) -> Result<SearchPage> {
        fs.search(dir, pattern, page, size).await
    }

    /// Streams `body` into `dir/file_name` and returns the bytes written.
    #[instrument(level = "debug", skip(self, fs, body))]
    pub async fn upload(
        &self,
        fs: &VirtualFs,
        dir: &str,
        file_name: &str,
        body: impl AsyncRead + Unpin,
    ) -> Result<u64> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(FsError::InvalidInput(format!("invalid file name {file_name:?}")));
        }
        let name = join(dir, file_name);
        let mut file = fs.create(&name).await?;
        let mut body = body;
        let written = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| stream_error(fs, e, &name))?;
        file.flush().await.map_err(|e| FsError::from_io(e, &name))?;
        Ok(written)
    }

    /// Deletes every path, stopping at the first failure.
    pub async fn delete(&self, fs: &VirtualFs, paths: &[&str]) -> Result<()> {
        for path in paths {
            fs.remove_all(path).await?;
        }
        Ok(())
    }

    pub async fn rename(&self, fs: &VirtualFs, from: &str, to: &str) -> Result<()> {
        fs.rename(from, to).await
    }

    /// Moves every path into `dest_dir`, keeping base names.
    pub async fn move_to(&self, fs: &VirtualFs, paths: &[&str], dest_dir: &str) -> Result<()> {
        for path in paths {
            let normalized = vpath::normalize(path);
            let base = normalized.rsplit('/').next().unwrap_or_default();
            fs.rename(path, &join(dest_dir, base)).await?;
        }
        Ok(())
    }

    /// Mints a download link for `path` on behalf of `auth_token`.
    pub async fn create_download_link(
        &self,
        fs: &VirtualFs,
        path: &str,
        auth_token: &str,
    ) -> Result<DownloadTicket> {
        let real = fs.verify_path(path, Action::Read).await?;
        let entry = fs.stat(path).await?;
        let real_str = real
            .to_str()
            .ok_or_else(|| FsError::InvalidInput(format!("{path} is not valid UTF-8")))?;
        let id = self.links.create_link(real_str, auth_token)?;
        Ok(DownloadTicket {
            id,
            url: self.links.download_url(id, &entry.name, entry.is_dir),
        })
    }

    /// Opens the target of a download link. Directories are served as zip.
    ///
    /// The link's token decides which identity's rate applies.
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn download(&self, id: &str, cancel: CancellationToken) -> Result<Download> {
        let link = self.links.resolve_str(id)?;
        let claims = self.issuer.verify(&link.token)?;
        let rate = self.ctx.roles().rate_limit(&claims.role).await?;
        let limiter = self
            .limiters
            .get_limiter(&format!("{}-{}", claims.name, claims.role), rate);

        let real = PathBuf::from(&link.path);
        let meta = tokio::fs::metadata(&real)
            .await
            .map_err(|e| FsError::from_io(e, id))?;
        let base = real
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (file_name, size, body) = if meta.is_dir() {
            let dir = real.clone();
            let bytes = tokio::task::spawn_blocking(move || zip_directory(&dir))
                .await
                .map_err(|e| FsError::collaborator("archive task", e))?
                .map_err(|e| FsError::from_io(e, id))?;
            let size = bytes.len() as u64;
            let body: Box<dyn AsyncRead + Send + Unpin> = Box::new(Cursor::new(bytes));
            (format!("{base}.zip"), size, body)
        } else {
            let file = tokio::fs::File::open(&real)
                .await
                .map_err(|e| FsError::from_io(e, id))?;
            let body: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
            (base, meta.len(), body)
        };
        Ok(Download {
            file_name,
            size,
            body: limiter.limit_reader(body, cancel),
        })
    }

    /// Extracts an archive next to itself and streams progress.
    pub async fn unarchive(
        &self,
        fs: &VirtualFs,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ProgressStream> {
        let real = fs.verify_path(path, Action::Write).await?;
        let meta = tokio::fs::metadata(&real).await.map_err(|e| FsError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(FsError::InvalidInput(format!("{path} is a directory")));
        }
        Ok(self.extraction.unarchive(real, cancel))
    }

    /// Rebuilds the index. Privileged identities only.
    pub async fn reset_index(&self, fs: &VirtualFs) -> Result<usize> {
        if !fs.identity().privileged {
            return Err(FsError::AuthorizationDenied {
                path: "index".to_string(),
            });
        }
        self.rebuild().await
    }

    /// Index telemetry for observers.
    pub fn index_events(&self) -> broadcast::Receiver<IndexEvent> {
        self.index.subscribe()
    }
}

fn join(dir: &str, name: &str) -> String {
    let dir = vpath::normalize(dir);
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn stream_error(fs: &VirtualFs, err: std::io::Error, name: &str) -> FsError {
    if err.kind() == std::io::ErrorKind::Interrupted && fs.cancellation().is_cancelled() {
        FsError::RateLimitWaitCancelled
    } else {
        FsError::from_io(err, name)
    }
}

/// Zips `dir` into memory, entries relative to `dir`.
fn zip_directory(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let Some(name) = relative.to_str().filter(|n| !n.is_empty()) else {
            if !relative.as_os_str().is_empty() {
                warn!(path = %entry.path().display(), "skipping non UTF-8 path in archive");
            }
            continue;
        };
        let name = name.replace('\\', "/");
        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(std::io::Error::other)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options).map_err(std::io::Error::other)?;
            let mut file = std::fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut zip)?;
        }
    }
    Ok(zip.finish().map_err(std::io::Error::other)?.into_inner())
}
