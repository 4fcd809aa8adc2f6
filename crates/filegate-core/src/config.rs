//! Configuration for the file-serving core.
//!
//! Configuration is read from `config.toml` in the platform configuration
//! directory (`~/.config/filegate/config.toml` on Linux) unless an explicit
//! path is given. A missing file yields the defaults.
//!
//! # Example configuration
//!
//! ```toml
//! root = "/srv/files"
//! admin_role = "admin"
//!
//! [index]
//! storage = "disk"
//! data_dir = "/var/lib/filegate"
//! watch = true
//!
//! [limits]
//! chunk_size = 8192
//! limiter_idle_ttl = "30m"
//!
//! [links]
//! ttl = "3h"
//!
//! [session]
//! ttl = "8h"
//! jwt_secret = "change-me"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Directory tree exposed to clients.
    pub root: PathBuf,

    /// Role key that bypasses the authorization engine.
    pub admin_role: String,

    /// Name of the trash directory under `root`.
    pub trash_dir: String,

    pub index: IndexConfig,
    pub limits: LimitsConfig,
    pub links: LinksConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            admin_role: "admin".to_string(),
            trash_dir: ".tmp".to_string(),
            index: IndexConfig::default(),
            limits: LimitsConfig::default(),
            links: LinksConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    pub storage: StorageKind,

    /// Where the disk index and its backups live. Defaults to the platform
    /// data directory.
    pub data_dir: Option<PathBuf>,

    /// Reconcile out-of-band filesystem changes with a watcher.
    pub watch: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes per rate-limited I/O chunk.
    pub chunk_size: usize,

    #[serde(with = "humantime_serde")]
    pub limiter_idle_ttl: Duration,

    /// How long a role's configured rate is cached.
    #[serde(with = "humantime_serde")]
    pub role_rate_ttl: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::rate_limit::DEFAULT_CHUNK_SIZE,
            limiter_idle_ttl: Duration::from_secs(30 * 60),
            role_rate_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LinksConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Route prefix for download URLs.
    pub url_prefix: String,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3 * 3600),
            url_prefix: "/api/v1/fsd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Lifetime of minted auth tokens.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,

    pub jwt_secret: String,

    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Banner sent to FTP clients on connect.
    pub welcome: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(8 * 3600),
            token_ttl: Duration::from_secs(24 * 3600),
            jwt_secret: String::new(),
            sweep_interval: Duration::from_secs(60),
            welcome: "filegate ftp service".to_string(),
        }
    }
}

impl Config {
    /// Default config file location, if a home directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "filegate").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads configuration from `path`, or from [`Config::default_path`].
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Index data directory, falling back to the platform data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.index
            .data_dir
            .clone()
            .or_else(|| {
                ProjectDirs::from("", "", "filegate").map(|dirs| dirs.data_dir().to_path_buf())
            })
            .unwrap_or_else(|| std::env::temp_dir().join("filegate"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must not be empty".into()));
        }
        if self.limits.chunk_size == 0 {
            return Err(ConfigError::Invalid("limits.chunk_size must be positive".into()));
        }
        if self.session.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("session.jwt_secret must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.admin_role, "admin");
        assert_eq!(config.trash_dir, ".tmp");
        assert_eq!(config.limits.chunk_size, 8192);
        assert_eq!(config.links.ttl, Duration::from_secs(3 * 3600));
        assert_eq!(config.session.ttl, Duration::from_secs(8 * 3600));
        assert_eq!(config.index.storage, StorageKind::Memory);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml(
            r#"
            root = "/srv/files"

            [index]
            storage = "disk"
            watch = true

            [limits]
            limiter_idle_ttl = "10m"

            [session]
            jwt_secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/srv/files"));
        assert_eq!(config.index.storage, StorageKind::Disk);
        assert!(config.index.watch);
        assert_eq!(config.limits.limiter_idle_ttl, Duration::from_secs(600));
        assert_eq!(config.limits.chunk_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_secret() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.admin_role, "admin");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "root = [").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(ConfigError::Parse { .. })));
    }
}
