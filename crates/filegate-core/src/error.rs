//! Error types for the file-serving core.
//!
//! Operating-system errors are translated exactly once, at the VirtualFS
//! boundary, through [`FsError::from_io`]. Paths carried in errors are the
//! names the client used, never resolved real paths.

use filegate_common::{ErrorCategory, business_code};
use serde::Serialize;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// Domain error taxonomy shared by every protocol surface.
#[derive(Debug, Error)]
pub enum FsError {
    /// The authorization engine denied the action.
    #[error("permission denied: {path}")]
    AuthorizationDenied { path: String },

    /// The path contained whitespace or a `..` component.
    #[error("illegal path: {path}")]
    PathUnsafe { path: String },

    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("file or directory already exists: {path}")]
    AlreadyExists { path: String },

    #[error("directory not empty: {path}")]
    NotEmpty { path: String },

    /// The operating system refused access (EACCES).
    #[error("operation not permitted on {path}")]
    PermissionDenied { path: String },

    #[error("download link expired or unknown")]
    LinkExpired,

    #[error("extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    #[error("extraction cancelled")]
    ExtractionCancelled,

    #[error("timed out after {waited:?} waiting for clients to disconnect")]
    SessionTimeout { waited: Duration },

    #[error("transfer cancelled while waiting for rate limit")]
    RateLimitWaitCancelled,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An external collaborator (policy engine, role store, audit sink) failed.
    #[error("{service} unavailable: {message}")]
    Collaborator {
        service: &'static str,
        message: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Translates an OS error for `path` into the domain taxonomy.
    pub fn from_io(err: io::Error, path: impl Display) -> Self {
        let path = path.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            io::ErrorKind::DirectoryNotEmpty => Self::NotEmpty { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source: err },
        }
    }

    pub fn collaborator(service: &'static str, err: impl Display) -> Self {
        Self::Collaborator {
            service,
            message: err.to_string(),
        }
    }

    /// Recovers an owned error from one shared between several waiters.
    ///
    /// The last holder gets the original; others get an equivalent copy
    /// whose I/O source keeps only its kind and message.
    pub fn from_shared(err: Arc<FsError>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(|shared| shared.duplicate())
    }

    fn duplicate(&self) -> Self {
        match self {
            Self::AuthorizationDenied { path } => Self::AuthorizationDenied { path: path.clone() },
            Self::PathUnsafe { path } => Self::PathUnsafe { path: path.clone() },
            Self::NotFound { path } => Self::NotFound { path: path.clone() },
            Self::AlreadyExists { path } => Self::AlreadyExists { path: path.clone() },
            Self::NotEmpty { path } => Self::NotEmpty { path: path.clone() },
            Self::PermissionDenied { path } => Self::PermissionDenied { path: path.clone() },
            Self::LinkExpired => Self::LinkExpired,
            Self::ExtractionFailed { reason } => Self::ExtractionFailed {
                reason: reason.clone(),
            },
            Self::ExtractionCancelled => Self::ExtractionCancelled,
            Self::SessionTimeout { waited } => Self::SessionTimeout { waited: *waited },
            Self::RateLimitWaitCancelled => Self::RateLimitWaitCancelled,
            Self::Authentication(msg) => Self::Authentication(msg.clone()),
            Self::InvalidInput(msg) => Self::InvalidInput(msg.clone()),
            Self::Collaborator { service, message } => Self::Collaborator {
                service: *service,
                message: message.clone(),
            },
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthorizationDenied { .. } | Self::PermissionDenied { .. } => {
                ErrorCategory::AccessDenied
            }
            Self::PathUnsafe { .. } | Self::InvalidInput(_) => ErrorCategory::InvalidArgument,
            Self::NotFound { .. } | Self::LinkExpired => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            Self::NotEmpty { .. } => ErrorCategory::NotEmpty,
            Self::ExtractionFailed { .. } | Self::Collaborator { .. } => {
                ErrorCategory::OperationFailed
            }
            Self::ExtractionCancelled | Self::RateLimitWaitCancelled => ErrorCategory::Cancelled,
            Self::SessionTimeout { .. } => ErrorCategory::Timeout,
            Self::Authentication(_) => ErrorCategory::Unauthorized,
            Self::Io { source, .. } => ErrorCategory::from(source),
        }
    }

    /// FTP reply code for this error.
    pub fn ftp_reply(&self) -> u16 {
        self.category().ftp_reply()
    }

    pub fn http_status(&self) -> u16 {
        self.category().http_status()
    }

    /// Converts this error into a `std::io::Error`, for stream adapters.
    pub fn into_io(self) -> io::Error {
        let kind = match self.category() {
            ErrorCategory::NotFound => io::ErrorKind::NotFound,
            ErrorCategory::AccessDenied => io::ErrorKind::PermissionDenied,
            ErrorCategory::Cancelled => io::ErrorKind::Interrupted,
            ErrorCategory::Timeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        match self {
            Self::Io { source, .. } => source,
            other => io::Error::new(kind, other),
        }
    }
}

/// JSON body returned by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiReply<T: Serialize> {
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiReply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: business_code::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

impl ApiReply<()> {
    pub fn error(err: &FsError) -> Self {
        Self {
            code: err.category().business_code(),
            msg: err.to_string(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_translate_once() {
        let err = FsError::from_io(io::Error::from(io::ErrorKind::NotFound), "/a.txt");
        assert!(matches!(err, FsError::NotFound { ref path } if path == "/a.txt"));

        let err = FsError::from_io(io::Error::from(io::ErrorKind::DirectoryNotEmpty), "/d");
        assert!(matches!(err, FsError::NotEmpty { .. }));

        let err = FsError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/d");
        assert!(matches!(err, FsError::PermissionDenied { .. }));

        let err = FsError::from_io(io::Error::other("boom"), "/d");
        assert!(matches!(err, FsError::Io { .. }));
    }

    #[test]
    fn authorization_denial_is_distinct_from_os_denial() {
        let denied = FsError::AuthorizationDenied { path: "/x".into() };
        let os = FsError::PermissionDenied { path: "/x".into() };
        assert_eq!(denied.category(), os.category());
        assert_ne!(denied.to_string(), os.to_string());
        assert!(!matches!(os, FsError::AuthorizationDenied { .. }));
    }

    #[test]
    fn ftp_replies() {
        assert_eq!(FsError::NotFound { path: "/a".into() }.ftp_reply(), 550);
        assert_eq!(FsError::AuthorizationDenied { path: "/a".into() }.ftp_reply(), 550);
        assert_eq!(FsError::PathUnsafe { path: "/../a".into() }.ftp_reply(), 553);
        assert_eq!(FsError::Authentication("bad password".into()).ftp_reply(), 530);
    }

    #[test]
    fn api_reply_carries_business_code() {
        let reply = ApiReply::error(&FsError::LinkExpired);
        assert_eq!(reply.code, business_code::NOT_FOUND);
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("data"));

        let ok = ApiReply::ok(vec!["a"]);
        assert_eq!(ok.code, business_code::SUCCESS);
    }

    #[test]
    fn shared_errors_keep_their_variant() {
        let shared = Arc::new(FsError::Authentication("bad password".into()));
        let other = Arc::clone(&shared);
        let first = FsError::from_shared(shared);
        let second = FsError::from_shared(other);
        assert!(matches!(first, FsError::Authentication(ref m) if m == "bad password"));
        assert!(matches!(second, FsError::Authentication(_)));

        let io = Arc::new(FsError::from_io(io::Error::other("disk on fire"), "/x"));
        let _keep = Arc::clone(&io);
        let copy = FsError::from_shared(io);
        assert!(copy.to_string().contains("disk on fire"));
    }

    #[test]
    fn cancellation_maps_to_interrupted() {
        let io = FsError::RateLimitWaitCancelled.into_io();
        assert_eq!(io.kind(), io::ErrorKind::Interrupted);
    }
}
