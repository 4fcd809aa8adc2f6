//! Shared harness for filegate-core integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use filegate_core::authz::{Account, Identity, Role, StaticPolicy, StaticRoles};
use filegate_core::session::{AuditSink, CredentialStore, LoginRecord};
use filegate_core::{Config, FileService, FsError, Result, VirtualFs};
use parking_lot::Mutex;

pub const TEST_SECRET: &str = "integration-secret";

/// A served temp directory with a service, a policy and a role table.
pub struct TestServer {
    pub dir: tempfile::TempDir,
    pub policy: Arc<StaticPolicy>,
    pub roles: Arc<StaticRoles>,
    pub service: FileService,
}

impl TestServer {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.root = dir.path().to_path_buf();
        config.session.jwt_secret = TEST_SECRET.to_string();
        config.session.ttl = Duration::from_secs(600);
        let policy = Arc::new(StaticPolicy::new());
        let roles = Arc::new(StaticRoles::new());
        let mut service = FileService::new(config, policy.clone(), roles.clone()).expect("service");
        service.init_index().await.expect("index");
        Self {
            dir,
            policy,
            roles,
            service,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes a file below the root and indexes it.
    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, content).expect("write");
        self.service.index().add_resource(&path).expect("index");
    }

    pub fn identity(&self, user: &str, role: &str) -> Identity {
        let account = Account { id: 42, name: user.to_string() };
        let role = Role { key: role.to_string(), name: role.to_string() };
        Identity::new(&account, &role, &self.service.config().admin_role)
    }

    pub fn fs(&self, user: &str, role: &str) -> VirtualFs {
        self.service.vfs(self.identity(user, role))
    }
}

/// Accepts any user whose password is "secret" and counts verifications.
#[derive(Default)]
pub struct CountingCredentials {
    pub verified: AtomicUsize,
}

impl CountingCredentials {
    pub fn count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for CountingCredentials {
    async fn verify(&self, user: &str, password: &str) -> Result<Account> {
        self.verified.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if password == "secret" {
            Ok(Account { id: 9, name: user.to_string() })
        } else {
            Err(FsError::Authentication("bad credentials".into()))
        }
    }

    async fn last_token_reset(&self, _user_id: i64) -> Result<i64> {
        Ok(0)
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub records: Mutex<Vec<LoginRecord>>,
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, record: LoginRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Builds a zip with the given `(name, content)` entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).expect("add directory");
        } else {
            zip.start_file(*name, options).expect("start file");
            zip.write_all(content).expect("write entry");
        }
    }
    zip.finish().expect("finish").into_inner()
}
