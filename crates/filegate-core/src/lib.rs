//! Permission-scoped file-serving core.
//!
//! - [`index::PathIndex`] - searchable mirror of every path under the root
//! - [`vfs::VirtualFs`] - per-identity filesystem with virtual-path encoding
//! - [`rate_limit::RateLimiterRegistry`] - shared token buckets per identity
//! - [`links::DownloadLinkRegistry`] - short-lived download links
//! - [`extract::ExtractionHub`] - single-run archive extraction with progress fan-out
//! - [`session::SessionManager`] - FTP logins, connection accounting and shutdown
//! - [`service::FileService`] - facade tying the above together

pub mod authz;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod extract;
pub mod index;
pub mod links;
pub mod rate_limit;
pub mod service;
pub mod session;
pub mod vfs;
pub mod vpath;

pub use authz::{Account, Action, Authorizer, Identity, Role, RoleStore, StaticPolicy, StaticRoles};
pub use config::Config;
pub use error::{ApiReply, FsError, Result};
pub use extract::{ExtractionHub, ProgressEvent, ProgressStream};
pub use index::{IndexEvent, PathIndex, Query};
pub use links::DownloadLinkRegistry;
pub use rate_limit::{Limiter, RateLimiterRegistry};
pub use service::FileService;
pub use session::{AuditSink, CredentialStore, SessionManager};
pub use vfs::{FsContext, VirtualFs};
