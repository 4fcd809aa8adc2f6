//! Process exit codes.

use filegate_common::ErrorCategory;
use filegate_core::FsError;

pub const SUCCESS: u8 = 0;
pub const GENERAL_ERROR: u8 = 1;
pub const CONFIG_ERROR: u8 = 2;
pub const NOT_FOUND: u8 = 3;
pub const ACCESS_DENIED: u8 = 4;
pub const INVALID_INPUT: u8 = 5;
pub const INTERRUPTED: u8 = 130;

/// Picks an exit code from the first typed error in the chain.
pub fn categorize(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if cause.downcast_ref::<filegate_core::config::ConfigError>().is_some() {
            return CONFIG_ERROR;
        }
        if let Some(fs_err) = cause.downcast_ref::<FsError>() {
            return match fs_err.category() {
                ErrorCategory::NotFound => NOT_FOUND,
                ErrorCategory::AccessDenied | ErrorCategory::Unauthorized | ErrorCategory::TokenExpired => {
                    ACCESS_DENIED
                }
                ErrorCategory::InvalidArgument | ErrorCategory::AlreadyExists | ErrorCategory::NotEmpty => {
                    INVALID_INPUT
                }
                ErrorCategory::Cancelled => INTERRUPTED,
                _ => GENERAL_ERROR,
            };
        }
    }
    GENERAL_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_pick_their_code() {
        let err = anyhow::Error::new(FsError::NotFound { path: "x".into() }).context("listing");
        assert_eq!(categorize(&err), NOT_FOUND);

        let err = anyhow::Error::new(FsError::PathUnsafe { path: "../x".into() });
        assert_eq!(categorize(&err), INVALID_INPUT);

        assert_eq!(categorize(&anyhow::anyhow!("plain")), GENERAL_ERROR);
    }
}
