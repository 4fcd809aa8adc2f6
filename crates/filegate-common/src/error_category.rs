//! Error category mapping for file-serving errors.
//!
//! Each protocol surface needs its own error representation:
//! - **HTTP**: a status code plus a stable business code in the JSON body
//! - **FTP**: a three digit reply code
//! - **local tooling**: POSIX errno values
//!
//! [`ErrorCategory`] is the intermediate representation that converts to all
//! of them, so an error is classified once and rendered per surface.

use std::io;

/// Stable business codes carried in HTTP reply bodies.
pub mod business_code {
    pub const SUCCESS: u32 = 1000;
    pub const ERROR: u32 = 1001;
    pub const BAD_REQUEST: u32 = 1002;
    pub const ACCESS_DENIED: u32 = 1003;
    pub const UNAUTHORIZED: u32 = 1004;
    pub const TOKEN_EXPIRED: u32 = 1005;
    pub const DATA_INVALID: u32 = 1006;
    pub const OPERATION_FAILED: u32 = 1007;
    pub const RATE_LIMIT_EXCEEDED: u32 = 1008;
    pub const NOT_FOUND: u32 = 1009;
}

/// Semantic category for file-serving errors.
///
/// # Example
///
/// ```
/// use filegate_common::ErrorCategory;
///
/// let err = std::io::Error::from(std::io::ErrorKind::NotFound);
/// let category = ErrorCategory::from(&err);
///
/// assert_eq!(category, ErrorCategory::NotFound);
/// assert_eq!(category.http_status(), 404);
/// assert_eq!(category.ftp_reply(), 550);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Resource not found (ENOENT, HTTP 404)
    NotFound,
    /// Resource already exists (EEXIST, HTTP 409)
    AlreadyExists,
    /// Directory not empty (ENOTEMPTY, HTTP 409)
    NotEmpty,
    /// Invalid path or argument, including traversal attempts (EINVAL, HTTP 400)
    InvalidArgument,
    /// Authorization engine or OS refused access (EACCES, HTTP 403)
    AccessDenied,
    /// Authentication failed (EPERM, HTTP 401)
    Unauthorized,
    /// Credentials were valid once but have been revoked or expired
    TokenExpired,
    /// Throughput limit reached (EAGAIN, HTTP 429)
    RateLimited,
    /// The caller abandoned the operation (ECANCELED)
    Cancelled,
    /// Waited too long for a condition (ETIMEDOUT, HTTP 504)
    Timeout,
    /// A well-formed request could not be carried out (EIO, HTTP 500)
    OperationFailed,
    /// Unclassified I/O failure (EIO, HTTP 500)
    IoError,
}

impl ErrorCategory {
    /// Converts this category to a POSIX errno value.
    #[inline]
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InvalidArgument => libc::EINVAL,
            Self::AccessDenied => libc::EACCES,
            Self::Unauthorized | Self::TokenExpired => libc::EPERM,
            Self::RateLimited => libc::EAGAIN,
            Self::Cancelled => libc::ECANCELED,
            Self::Timeout => libc::ETIMEDOUT,
            Self::OperationFailed | Self::IoError => libc::EIO,
        }
    }

    /// HTTP status code for this category.
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::AlreadyExists | Self::NotEmpty => 409,
            Self::InvalidArgument => 400,
            Self::AccessDenied => 403,
            Self::Unauthorized | Self::TokenExpired => 401,
            Self::RateLimited => 429,
            // Client closed request
            Self::Cancelled => 499,
            Self::Timeout => 504,
            Self::OperationFailed | Self::IoError => 500,
        }
    }

    /// Business code carried in HTTP reply bodies.
    pub fn business_code(self) -> u32 {
        match self {
            Self::NotFound => business_code::NOT_FOUND,
            Self::InvalidArgument => business_code::BAD_REQUEST,
            Self::AccessDenied => business_code::ACCESS_DENIED,
            Self::Unauthorized => business_code::UNAUTHORIZED,
            Self::TokenExpired => business_code::TOKEN_EXPIRED,
            Self::RateLimited => business_code::RATE_LIMIT_EXCEEDED,
            Self::AlreadyExists
            | Self::NotEmpty
            | Self::Cancelled
            | Self::Timeout
            | Self::OperationFailed => business_code::OPERATION_FAILED,
            Self::IoError => business_code::ERROR,
        }
    }

    /// Nearest standard FTP reply code (RFC 959).
    pub fn ftp_reply(self) -> u16 {
        match self {
            // 550 Requested action not taken. File unavailable (not found, no access).
            Self::NotFound | Self::AccessDenied | Self::NotEmpty => 550,
            // 553 Requested action not taken. File name not allowed.
            Self::AlreadyExists | Self::InvalidArgument => 553,
            // 530 Not logged in.
            Self::Unauthorized | Self::TokenExpired => 530,
            // 450 Requested file action not taken. File unavailable (busy).
            Self::RateLimited => 450,
            // 426 Connection closed; transfer aborted.
            Self::Cancelled => 426,
            // 421 Service not available, closing control connection.
            Self::Timeout => 421,
            // 451 Requested action aborted: local error in processing.
            Self::OperationFailed | Self::IoError => 451,
        }
    }

    /// Returns a human-readable name for this category.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotEmpty => "NotEmpty",
            Self::InvalidArgument => "InvalidArgument",
            Self::AccessDenied => "AccessDenied",
            Self::Unauthorized => "Unauthorized",
            Self::TokenExpired => "TokenExpired",
            Self::RateLimited => "RateLimited",
            Self::Cancelled => "Cancelled",
            Self::Timeout => "Timeout",
            Self::OperationFailed => "OperationFailed",
            Self::IoError => "IoError",
        }
    }
}

impl From<&io::Error> for ErrorCategory {
    fn from(e: &io::Error) -> Self {
        io_error_category(e)
    }
}

impl From<io::Error> for ErrorCategory {
    fn from(e: io::Error) -> Self {
        io_error_category(&e)
    }
}

/// Categorizes an I/O error based on its kind.
pub fn io_error_category(e: &io::Error) -> ErrorCategory {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorCategory::NotFound,
        io::ErrorKind::PermissionDenied => ErrorCategory::AccessDenied,
        io::ErrorKind::AlreadyExists => ErrorCategory::AlreadyExists,
        io::ErrorKind::DirectoryNotEmpty => ErrorCategory::NotEmpty,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCategory::InvalidArgument,
        io::ErrorKind::Interrupted => ErrorCategory::Cancelled,
        io::ErrorKind::TimedOut => ErrorCategory::Timeout,
        _ => ErrorCategory::IoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        let category = ErrorCategory::from(&err);
        assert_eq!(category, ErrorCategory::NotFound);
        assert_eq!(category.to_errno(), libc::ENOENT);
        assert_eq!(category.business_code(), business_code::NOT_FOUND);
    }

    #[test]
    fn test_io_directory_not_empty() {
        let err = io::Error::from(io::ErrorKind::DirectoryNotEmpty);
        assert_eq!(ErrorCategory::from(err), ErrorCategory::NotEmpty);
    }

    #[test]
    fn test_io_permission_denied() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let category = ErrorCategory::from(&err);
        assert_eq!(category, ErrorCategory::AccessDenied);
        assert_eq!(category.http_status(), 403);
        assert_eq!(category.ftp_reply(), 550);
    }

    #[test]
    fn test_io_other_is_generic() {
        let err = io::Error::other("disk on fire");
        let category = ErrorCategory::from(&err);
        assert_eq!(category, ErrorCategory::IoError);
        assert_eq!(category.business_code(), business_code::ERROR);
        assert_eq!(category.to_errno(), libc::EIO);
    }

    #[test]
    fn test_access_denied_and_not_found_share_ftp_reply() {
        assert_eq!(
            ErrorCategory::AccessDenied.ftp_reply(),
            ErrorCategory::NotFound.ftp_reply()
        );
    }

    #[test]
    fn test_rate_limited_codes() {
        let category = ErrorCategory::RateLimited;
        assert_eq!(category.http_status(), 429);
        assert_eq!(category.business_code(), business_code::RATE_LIMIT_EXCEEDED);
        assert_eq!(category.ftp_reply(), 450);
    }

    #[test]
    fn test_names_are_unique() {
        let all = [
            ErrorCategory::NotFound,
            ErrorCategory::AlreadyExists,
            ErrorCategory::NotEmpty,
            ErrorCategory::InvalidArgument,
            ErrorCategory::AccessDenied,
            ErrorCategory::Unauthorized,
            ErrorCategory::TokenExpired,
            ErrorCategory::RateLimited,
            ErrorCategory::Cancelled,
            ErrorCategory::Timeout,
            ErrorCategory::OperationFailed,
            ErrorCategory::IoError,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(ErrorCategory::name).collect();
        assert_eq!(names.len(), all.len());
    }
}
