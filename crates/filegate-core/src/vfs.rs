//! Permission-scoped virtual filesystem.
//!
//! A [`VirtualFs`] belongs to one session and one [`Identity`]. Every
//! operation resolves the client's name through [`VirtualFs::verify_path`]
//! before touching the disk. Privileged identities see the real tree under
//! the root. Restricted identities see their authorized roots as a flat
//! top-level listing of virtual names (see [`crate::vpath`]), and every path
//! they use is checked against the [`Authorizer`].
//!
//! Mutations run one at a time on the blocking pool and record their index
//! updates through [`PathIndex::apply`] once the filesystem call succeeded.
//! Deletes outside the trash directory move the entry to
//! `<root>/<trash>/<role>/<base>_<timestamp>`; deletes inside it are
//! permanent. The trash directory itself cannot be removed.

use std::fs::{self, File, FileTimes, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use filegate_common::AsyncTtlCache;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::authz::{Action, Authorizer, Identity, RESOURCE_PREFIX, RoleStore, resource_for};
use crate::error::{FsError, Result};
use crate::index::{Field, PathIndex, Query};
use crate::rate_limit::{Limited, Limiter, RateLimiterRegistry};
use crate::vpath;

/// File handle whose reads and writes pass through the identity's limiter.
pub type LimitedFile = Limited<tokio::fs::File>;

/// One entry of a listing or a stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// Client path to use in later calls.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl DirEntry {
    fn new(name: String, path: String, meta: &Metadata) -> Self {
        Self {
            name,
            path,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

/// A search hit, addressed by client path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchPage {
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

/// Which actions an identity holds on a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub update: bool,
    pub delete: bool,
}

impl Permissions {
    fn all() -> Self {
        Self {
            read: true,
            write: true,
            update: true,
            delete: true,
        }
    }

    fn set(&mut self, action: Action, allowed: bool) {
        match action {
            Action::Read => self.read = allowed,
            Action::Write => self.write = allowed,
            Action::Update => self.update = allowed,
            Action::Delete => self.delete = allowed,
        }
    }
}

/// How [`VirtualFs::open_file`] opens a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl FileOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Create or truncate for writing.
    pub fn write_new() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Whether these options may modify the file system.
    pub fn mutates(&self) -> bool {
        self.write || self.append || self.truncate || self.create || self.create_new
    }

    fn to_std(self) -> fs::OpenOptions {
        let mut opts = fs::OpenOptions::new();
        opts.read(self.read || !self.mutates())
            .write(self.write || self.truncate)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        opts
    }
}

/// State shared by every session's [`VirtualFs`].
pub struct FsContext {
    root: PathBuf,
    trash_dir: String,
    authorizer: Arc<dyn Authorizer>,
    roles: Arc<dyn RoleStore>,
    index: Arc<PathIndex>,
    limiters: Arc<RateLimiterRegistry>,
    role_rates: AsyncTtlCache<String, u64>,
    mutations: tokio::sync::Mutex<()>,
}

impl FsContext {
    /// The served root is the index root.
    pub fn new(
        index: Arc<PathIndex>,
        authorizer: Arc<dyn Authorizer>,
        roles: Arc<dyn RoleStore>,
        limiters: Arc<RateLimiterRegistry>,
        trash_dir: impl Into<String>,
        role_rate_ttl: Duration,
    ) -> Self {
        Self {
            root: index.root().to_path_buf(),
            trash_dir: trash_dir.into(),
            authorizer,
            roles,
            index,
            limiters,
            role_rates: AsyncTtlCache::new(role_rate_ttl),
            mutations: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &Arc<PathIndex> {
        &self.index
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    pub fn roles(&self) -> &Arc<dyn RoleStore> {
        &self.roles
    }

    pub fn trash_root(&self) -> PathBuf {
        self.root.join(&self.trash_dir)
    }

    /// Forgets cached role rates, e.g. after a role was edited.
    pub fn clear_role_rates(&self) {
        self.role_rates.clear();
    }
}

/// The filesystem as one identity sees it.
pub struct VirtualFs {
    ctx: Arc<FsContext>,
    identity: Identity,
    cancel: CancellationToken,
}

impl VirtualFs {
    pub fn new(ctx: Arc<FsContext>, identity: Identity) -> Self {
        Self {
            ctx,
            identity,
            cancel: CancellationToken::new(),
        }
    }

    /// Ties every limited stream of this filesystem to `cancel`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves a client name to a real path, enforcing `action`.
    ///
    /// Restricted identities are checked against the authorizer before
    /// anything is resolved; a denial returns `AuthorizationDenied`.
    pub async fn verify_path(&self, name: &str, action: Action) -> Result<PathBuf> {
        let relative = if self.identity.privileged {
            vpath::normalize(name)
        } else {
            self.decode_restricted(name).await?
        };
        check_safe(name, &relative)?;

        if !self.identity.privileged {
            let resource = resource_for(&relative);
            let allowed = self
                .ctx
                .authorizer
                .enforce(&self.identity.role_key, &resource, action)
                .await?;
            if !allowed {
                debug!(identity = %self.identity.name, %resource, %action, "authorization denied");
                return Err(FsError::AuthorizationDenied {
                    path: name.to_string(),
                });
            }
        }
        Ok(self.real_path(&relative))
    }

    /// Decodes a restricted client path.
    ///
    /// A first component that decodes as a token but is also the literal name
    /// of an authorized root resolves to that root.
    async fn decode_restricted(&self, name: &str) -> Result<String> {
        let decoded = vpath::decode_path(name);
        let literal = vpath::normalize(name);
        if decoded == literal {
            return Ok(decoded);
        }
        let first = literal.split('/').next().unwrap_or_default();
        let resources = self
            .ctx
            .authorizer
            .permitted_resources(&self.identity.role_key, Action::Read)
            .await?;
        if resources.iter().any(|r| authorized_root(r) == first) {
            Ok(literal)
        } else {
            Ok(decoded)
        }
    }

    fn real_path(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.ctx.root.clone()
        } else {
            self.ctx.root.join(relative)
        }
    }

    /// Lists a directory.
    ///
    /// For restricted identities the root lists one entry per authorized
    /// root, named by its virtual path. No policies means an empty listing.
    #[instrument(level = "debug", skip(self), fields(identity = %self.identity.name))]
    pub async fn list(&self, name: &str) -> Result<Vec<DirEntry>> {
        if !self.identity.privileged && vpath::normalize(name).is_empty() {
            return self.list_authorized_roots().await;
        }
        let real = self.verify_path(name, Action::Read).await?;
        if real == self.ctx.trash_root() {
            let (root, bin, owned) = (self.ctx.root.clone(), self.trash_bin(), name.to_string());
            self.mutate(move |index| create_missing(index, &root, &bin, &owned))
                .await?;
        }
        read_dir_entries(&real, &vpath::normalize(name), name)
    }

    async fn list_authorized_roots(&self) -> Result<Vec<DirEntry>> {
        let resources = self
            .ctx
            .authorizer
            .permitted_resources(&self.identity.role_key, Action::Read)
            .await?;

        let mut roots: Vec<String> = resources.iter().map(|r| authorized_root(r)).collect();
        if roots.iter().any(String::is_empty) {
            return read_dir_entries(&self.ctx.root, "", "/");
        }
        roots.sort();
        roots.dedup();

        let mut entries = Vec::with_capacity(roots.len());
        for root in roots {
            if check_safe(&root, &root).is_err() {
                warn!(%root, "ignoring unsafe authorized root");
                continue;
            }
            let real = self.real_path(&root);
            match fs::metadata(&real) {
                Ok(meta) => {
                    let encoded = vpath::encode(&root);
                    entries.push(DirEntry::new(encoded.clone(), encoded, &meta));
                }
                Err(e) => warn!(%root, error = %e, "skipping missing authorized root"),
            }
        }
        Ok(entries)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn stat(&self, name: &str) -> Result<DirEntry> {
        let real = self.verify_path(name, Action::Read).await?;
        let meta = fs::metadata(&real).map_err(|e| FsError::from_io(e, name))?;
        let path = vpath::normalize(name);
        let base = path.rsplit('/').next().unwrap_or_default().to_string();
        Ok(DirEntry::new(base, path, &meta))
    }

    /// Creates (or truncates) a file for writing.
    #[instrument(level = "debug", skip(self))]
    pub async fn create(&self, name: &str) -> Result<LimitedFile> {
        self.open_file(name, FileOptions::write_new()).await
    }

    /// Opens a file through the identity's rate limiter.
    ///
    /// Options that write or create require the write action, others read.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_file(&self, name: &str, options: FileOptions) -> Result<LimitedFile> {
        let action = if options.mutates() { Action::Write } else { Action::Read };
        let real = self.verify_path(name, action).await?;
        let limiter = self.limiter().await?;

        let std_opts = options.to_std();
        let file = if options.create || options.create_new {
            let name = name.to_string();
            self.mutate(move |index| {
                let existed = fs::symlink_metadata(&real).is_ok();
                let file = std_opts.open(&real).map_err(|e| FsError::from_io(e, &name))?;
                if !existed {
                    index.apply(|txn| Ok(txn.add_resource(&real)))?;
                }
                Ok(tokio::fs::File::from_std(file))
            })
            .await?
        } else {
            tokio::fs::OpenOptions::from(std_opts)
                .open(&real)
                .await
                .map_err(|e| FsError::from_io(e, name))?
        };
        Ok(limiter.limit_read_writer(file, self.cancel.clone()))
    }

    /// Opens a file for download, returning its metadata as well.
    pub async fn read_to_limited(&self, name: &str) -> Result<(LimitedFile, DirEntry)> {
        let entry = self.stat(name).await?;
        if entry.is_dir {
            return Err(FsError::InvalidInput(format!("{name} is a directory")));
        }
        let file = self.open_file(name, FileOptions::read_only()).await?;
        Ok((file, entry))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn mkdir(&self, name: &str) -> Result<()> {
        let real = self.verify_path(name, Action::Write).await?;
        let name = name.to_string();
        self.mutate(move |index| {
            fs::create_dir(&real).map_err(|e| FsError::from_io(e, &name))?;
            index.apply(|txn| Ok(txn.add_resource(&real)))?;
            Ok(())
        })
        .await
    }

    /// Creates a directory and any missing parents.
    #[instrument(level = "debug", skip(self))]
    pub async fn mkdir_all(&self, name: &str) -> Result<()> {
        let real = self.verify_path(name, Action::Write).await?;
        let root = self.ctx.root.clone();
        let name = name.to_string();
        self.mutate(move |index| create_missing(index, &root, &real, &name))
            .await
    }

    /// Renames `from` to `to`. Renaming onto an existing entry fails.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let real_from = self.verify_path(from, Action::Delete).await?;
        let real_to = self.verify_path(to, Action::Write).await?;
        if real_from == real_to {
            return Ok(());
        }
        if real_from == self.ctx.root {
            return Err(FsError::InvalidInput("cannot rename the root".to_string()));
        }
        let (from, to) = (from.to_string(), to.to_string());
        self.mutate(move |index| {
            if fs::symlink_metadata(&real_to).is_ok() {
                return Err(FsError::AlreadyExists { path: to });
            }
            fs::rename(&real_from, &real_to).map_err(|e| FsError::from_io(e, &from))?;
            index.apply(|txn| {
                txn.add_resource(&real_to);
                txn.del_tree(&real_from);
                Ok(())
            })
        })
        .await
    }

    /// Deletes a file or an empty directory.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.delete(name, false).await
    }

    /// Deletes a file or a directory with everything below it.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove_all(&self, name: &str) -> Result<()> {
        self.delete(name, true).await
    }

    async fn delete(&self, name: &str, recursive: bool) -> Result<()> {
        let real = self.verify_path(name, Action::Delete).await?;
        if real == self.ctx.root {
            return Err(FsError::InvalidInput("cannot remove the root".to_string()));
        }
        let trash_root = self.ctx.trash_root();
        if real == trash_root {
            return Err(FsError::InvalidInput("cannot remove the trash directory".to_string()));
        }
        let bin = self.trash_bin();
        let name = name.to_string();
        self.mutate(move |index| {
            if real.starts_with(&trash_root) {
                remove_permanently(&real, recursive).map_err(|e| FsError::from_io(e, &name))?;
                index.apply(|txn| Ok(txn.del_tree(&real)))?;
                debug!(path = %real.display(), "removed from trash");
                Ok(())
            } else {
                move_to_trash(index, &real, &bin, &name)
            }
        })
        .await
    }

    /// This identity's directory inside the trash.
    fn trash_bin(&self) -> PathBuf {
        self.ctx.trash_root().join(&self.identity.role_key)
    }

    /// Runs a filesystem mutation and its index update on the blocking pool.
    ///
    /// Mutations are serialized by the context's gate. The index lock is only
    /// taken for the update that follows a successful filesystem call.
    async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PathIndex) -> Result<T> + Send + 'static,
    {
        let _gate = self.ctx.mutations.lock().await;
        let index = Arc::clone(&self.ctx.index);
        tokio::task::spawn_blocking(move || op(&index))
            .await
            .map_err(|e| FsError::collaborator("filesystem task", e))?
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        let real = self.verify_path(name, Action::Update).await?;
        set_mode(&real, mode).map_err(|e| FsError::from_io(e, name))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn chown(&self, name: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let real = self.verify_path(name, Action::Update).await?;
        set_owner(&real, uid, gid).map_err(|e| FsError::from_io(e, name))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn chtimes(&self, name: &str, accessed: SystemTime, modified: SystemTime) -> Result<()> {
        let real = self.verify_path(name, Action::Update).await?;
        let times = FileTimes::new().set_accessed(accessed).set_modified(modified);
        File::open(&real)
            .and_then(|f| f.set_times(times))
            .map_err(|e| FsError::from_io(e, name))
    }

    /// Searches below `dir` for names containing `pattern`.
    #[instrument(level = "debug", skip(self))]
    pub async fn search(&self, dir: &str, pattern: &str, page: usize, size: usize) -> Result<SearchPage> {
        let real_dir = self.verify_path(dir, Action::Read).await?;
        let Some(real_dir_str) = real_dir.to_str() else {
            return Ok(SearchPage::default());
        };
        let below = format!("{}/", real_dir_str.trim_end_matches('/'));
        let query = Query::new()
            .prefix(Field::Path, below.clone())
            .contains(Field::Name, pattern)
            .page(page, size);
        let result = self.ctx.index.search(&query);

        let client_dir = vpath::normalize(dir);
        let hits = result
            .hits
            .into_iter()
            .map(|doc| {
                let rest = doc.path.strip_prefix(&below).unwrap_or(&doc.name);
                let path = if client_dir.is_empty() {
                    rest.to_string()
                } else {
                    format!("{client_dir}/{rest}")
                };
                SearchHit {
                    name: doc.name,
                    path,
                    is_dir: doc.is_dir,
                }
            })
            .collect();
        Ok(SearchPage {
            total: result.total,
            hits,
        })
    }

    /// Reports which actions this identity holds on `name`.
    pub async fn permissions(&self, name: &str) -> Result<Permissions> {
        if self.identity.privileged {
            check_safe(name, &vpath::normalize(name))?;
            return Ok(Permissions::all());
        }
        let relative = vpath::decode_path(name);
        check_safe(name, &relative)?;
        let resource = resource_for(&relative);
        let mut perms = Permissions::default();
        for action in Action::ALL {
            let allowed = self
                .ctx
                .authorizer
                .enforce(&self.identity.role_key, &resource, action)
                .await?;
            perms.set(action, allowed);
        }
        Ok(perms)
    }

    /// The limiter for this identity's current role rate.
    pub async fn limiter(&self) -> Result<Arc<Limiter>> {
        let role_key = &self.identity.role_key;
        let roles = Arc::clone(&self.ctx.roles);
        let rate = self
            .ctx
            .role_rates
            .try_get_or_insert(role_key, || async move { roles.rate_limit(role_key).await })
            .await
            .map_err(FsError::from_shared)?;
        Ok(self.ctx.limiters.get_limiter(&self.identity.limiter_key(), rate))
    }
}

/// Strips the resource prefix and trailing wildcards from a policy pattern.
fn authorized_root(resource: &str) -> String {
    let rest = resource.strip_prefix(RESOURCE_PREFIX).unwrap_or(resource);
    let rest = rest.strip_suffix(".*").unwrap_or(rest);
    vpath::normalize(rest)
}

/// Rejects whitespace and `..` components in the raw or decoded name.
fn check_safe(name: &str, relative: &str) -> Result<()> {
    let unsafe_path = [name, relative].iter().any(|p| {
        p.chars().any(char::is_whitespace) || p.split(['/', '\\']).any(|seg| seg == "..")
    });
    if unsafe_path {
        return Err(FsError::PathUnsafe {
            path: name.to_string(),
        });
    }
    Ok(())
}

/// Creates `real` and its missing parents, indexing the first one created.
fn create_missing(index: &PathIndex, root: &Path, real: &Path, name: &str) -> Result<()> {
    let first_missing = real
        .ancestors()
        .take_while(|p| p.starts_with(root) && *p != root && !p.exists())
        .last()
        .map(Path::to_path_buf);
    fs::create_dir_all(real).map_err(|e| FsError::from_io(e, name))?;
    if let Some(created) = first_missing {
        index.apply(|txn| Ok(txn.add_resource(&created)))?;
    }
    Ok(())
}

/// Moves `real` into `bin` as `<base>_<timestamp>`.
fn move_to_trash(index: &PathIndex, real: &Path, bin: &Path, name: &str) -> Result<()> {
    fs::symlink_metadata(real).map_err(|e| FsError::from_io(e, name))?;
    fs::create_dir_all(bin).map_err(|e| FsError::from_io(e, name))?;

    let base = real
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
    let mut target = bin.join(format!("{base}_{stamp}"));
    let mut attempt = 1;
    while fs::symlink_metadata(&target).is_ok() {
        target = bin.join(format!("{base}_{stamp}_{attempt}"));
        attempt += 1;
    }

    fs::rename(real, &target).map_err(|e| FsError::from_io(e, name))?;
    index.apply(|txn| {
        txn.del_tree(real);
        txn.add_resource(&target);
        Ok(())
    })?;
    debug!(from = %real.display(), to = %target.display(), "moved to trash");
    Ok(())
}

fn read_dir_entries(real: &Path, client_dir: &str, name: &str) -> Result<Vec<DirEntry>> {
    let reader = fs::read_dir(real).map_err(|e| FsError::from_io(e, name))?;
    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry.map_err(|e| FsError::from_io(e, name))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(entry = %file_name, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = if client_dir.is_empty() {
            file_name.clone()
        } else {
            format!("{client_dir}/{file_name}")
        };
        entries.push(DirEntry::new(file_name, path, &meta));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn remove_permanently(real: &Path, recursive: bool) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(real)?;
    match (meta.is_dir(), recursive) {
        (true, true) => fs::remove_dir_all(real),
        (true, false) => fs::remove_dir(real),
        (false, _) => fs::remove_file(real),
    }
}

#[cfg(unix)]
fn set_mode(real: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(real, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(real: &Path, mode: u32) -> std::io::Result<()> {
    let mut perms = fs::metadata(real)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(real, perms)
}

#[cfg(unix)]
fn set_owner(real: &Path, uid: Option<u32>, gid: Option<u32>) -> std::io::Result<()> {
    std::os::unix::fs::chown(real, uid, gid)
}

#[cfg(not(unix))]
fn set_owner(_real: &Path, _uid: Option<u32>, _gid: Option<u32>) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "chown is not supported on this platform",
    ))
}
