//! FTP-style session lifecycle.
//!
//! [`SessionManager`] authenticates clients, caches the resulting
//! [`ProtocolSession`] under a digest of the credentials, records every
//! attempt with the [`AuditSink`], and counts connected clients so the
//! service can drain them on shutdown.
//!
//! A cached session is reused only while its token was issued after the
//! account's last forced token reset. Concurrent logins with the same
//! credentials are collapsed into one call to the credential store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filegate_common::{SingleFlight, SweeperHandle, TtlMap};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::authz::{Account, Identity};
use crate::config::SessionConfig;
use crate::error::{FsError, Result};
use crate::vfs::{FsContext, VirtualFs};

/// Channel name recorded for logins through this manager.
pub const FTP_CHANNEL: &str = "ftp";

/// FTP reply for a successful login.
pub const LOGIN_OK_REPLY: u16 = 230;

/// Credential verification, owned by the identity service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the account, or `FsError::Authentication` for bad credentials.
    async fn verify(&self, user: &str, password: &str) -> Result<Account>;

    /// Unix seconds of the account's last forced token reset.
    async fn last_token_reset(&self, user_id: i64) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginOutcome {
    Success,
    Failure,
}

/// One login attempt, as handed to the audit sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub remote_addr: String,
    pub user_name: String,
    pub outcome: LoginOutcome,
    pub channel: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: LoginRecord) -> Result<()>;
}

/// Claims carried by session tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and checks HS256 session tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(&self, identity: &Identity) -> Result<(String, Claims)> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: identity.user_id.to_string(),
            name: identity.name.clone(),
            role: identity.role_key.clone(),
            iat,
            exp: iat.saturating_add(ttl),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| FsError::collaborator("token signer", e))?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| FsError::Authentication(format!("invalid token: {e}")))
    }
}

/// An authenticated client and its filesystem view.
pub struct ProtocolSession {
    pub identity: Identity,
    pub auth_token: String,
    pub claims: Claims,
    pub authenticated_at: DateTime<Utc>,
    pub fs: Arc<VirtualFs>,
}

impl fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("identity", &self.identity)
            .field("claims", &self.claims)
            .field("authenticated_at", &self.authenticated_at)
            .finish_non_exhaustive()
    }
}

/// Cache key for a login: hex SHA-256 of user and password.
///
/// The plaintext password is never stored.
pub fn session_key(user: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionState {
    active: usize,
    stopping: bool,
}

type LoginResult = std::result::Result<Arc<ProtocolSession>, Arc<FsError>>;

/// Everything a fresh login needs; shared with in-flight login tasks.
struct Authenticator {
    ctx: Arc<FsContext>,
    credentials: Arc<dyn CredentialStore>,
    issuer: TokenIssuer,
    admin_role: String,
    sessions: Arc<TtlMap<String, Arc<ProtocolSession>>>,
    shutdown: CancellationToken,
}

impl Authenticator {
    async fn login(&self, key: String, user: &str, password: &str) -> Result<Arc<ProtocolSession>> {
        let account = self.credentials.verify(user, password).await?;
        let role = self
            .ctx
            .roles()
            .role_for(&account)
            .await?
            .ok_or_else(|| FsError::AuthorizationDenied {
                path: "no directory permission".to_string(),
            })?;

        let identity = Identity::new(&account, &role, &self.admin_role);
        let (auth_token, claims) = self.issuer.issue(&identity)?;
        let fs = VirtualFs::new(Arc::clone(&self.ctx), identity.clone())
            .with_cancellation(self.shutdown.child_token());
        let session = Arc::new(ProtocolSession {
            identity,
            auth_token,
            claims,
            authenticated_at: Utc::now(),
            fs: Arc::new(fs),
        });
        self.sessions.insert(key, Arc::clone(&session));
        info!(user, role = %role.key, privileged = session.identity.privileged, "session authenticated");
        Ok(session)
    }
}

/// Authentication, session caching and connection accounting.
pub struct SessionManager {
    auth: Arc<Authenticator>,
    audit: Arc<dyn AuditSink>,
    logins: SingleFlight<String, LoginResult>,
    connections: watch::Sender<ConnectionState>,
    welcome: String,
    _sweeper: Option<SweeperHandle>,
}

impl SessionManager {
    /// Creates a manager. Inside a tokio runtime the session cache is also
    /// swept every `config.sweep_interval`.
    pub fn new(
        ctx: Arc<FsContext>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        admin_role: impl Into<String>,
        config: &SessionConfig,
    ) -> Self {
        let sessions = Arc::new(TtlMap::new(config.ttl));
        let sweeper = tokio::runtime::Handle::try_current()
            .is_ok()
            .then(|| sessions.spawn_sweeper(config.sweep_interval));
        let (connections, _) = watch::channel(ConnectionState::default());
        Self {
            auth: Arc::new(Authenticator {
                ctx,
                credentials,
                issuer: TokenIssuer::new(config.jwt_secret.as_bytes(), config.token_ttl),
                admin_role: admin_role.into(),
                sessions,
                shutdown: CancellationToken::new(),
            }),
            audit,
            logins: SingleFlight::new(),
            connections,
            welcome: config.welcome.clone(),
            _sweeper: sweeper,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.auth.issuer
    }

    /// Authenticates `user`, reusing a valid cached session.
    ///
    /// Every attempt is audited in the background, cache hits included.
    #[instrument(level = "debug", skip(self, password))]
    pub async fn authenticate(
        &self,
        user: &str,
        password: &str,
        remote_addr: &str,
    ) -> Result<Arc<ProtocolSession>> {
        let key = session_key(user, password);
        let result = self.login(key, user, password).await;
        self.audit(remote_addr, user, result.as_ref().err());
        result
    }

    async fn login(&self, key: String, user: &str, password: &str) -> Result<Arc<ProtocolSession>> {
        if let Some(session) = self.auth.sessions.get(&key) {
            match self
                .auth
                .credentials
                .last_token_reset(session.identity.user_id)
                .await
            {
                Ok(reset) if session.claims.iat > reset => {
                    debug!(user, "reusing cached session");
                    return Ok(session);
                }
                Ok(_) => {
                    debug!(user, "cached session predates token reset");
                    self.auth.sessions.remove(&key);
                }
                Err(e) => {
                    warn!(user, error = %e, "could not check token reset, re-authenticating");
                    self.auth.sessions.remove(&key);
                }
            }
        }

        let auth = Arc::clone(&self.auth);
        let (user, password) = (user.to_string(), password.to_string());
        let flight_key = key.clone();
        self.logins
            .run(flight_key, move || async move {
                auth.login(key, &user, &password).await.map_err(Arc::new)
            })
            .await
            .map_err(FsError::from_shared)
    }

    fn audit(&self, remote_addr: &str, user: &str, error: Option<&FsError>) {
        let record = LoginRecord {
            remote_addr: remote_addr.to_string(),
            user_name: user.to_string(),
            outcome: if error.is_none() {
                LoginOutcome::Success
            } else {
                LoginOutcome::Failure
            },
            channel: FTP_CHANNEL.to_string(),
            message: error.map_or_else(|| "login ok".to_string(), ToString::to_string),
            at: Utc::now(),
        };
        let sink = Arc::clone(&self.audit);
        tokio::spawn(async move {
            if let Err(e) = sink.record(record).await {
                warn!(error = %e, "failed to record login");
            }
        });
    }

    /// Drops the cached session for `key`.
    pub fn invalidate(&self, key: &str) -> bool {
        self.auth.sessions.remove(&key.to_string()).is_some()
    }

    /// Drops every cached session of `user_id`.
    pub fn invalidate_user(&self, user_id: i64) {
        self.auth
            .sessions
            .invalidate_where(|_, session| session.identity.user_id == user_id);
    }

    pub fn cached_sessions(&self) -> usize {
        self.auth.sessions.len()
    }

    /// Registers a client and returns the welcome banner.
    pub fn client_connected(&self) -> String {
        self.connections.send_modify(|state| state.active += 1);
        self.welcome.clone()
    }

    pub fn client_disconnected(&self) {
        self.connections
            .send_modify(|state| state.active = state.active.saturating_sub(1));
    }

    pub fn active_connections(&self) -> usize {
        self.connections.borrow().active
    }

    /// Stops accepting the service as running; completion fires once the
    /// last client has disconnected.
    pub fn stop(&self) {
        self.connections.send_modify(|state| state.stopping = true);
        info!(active = self.active_connections(), "session manager stopping");
    }

    /// Waits up to `timeout` for every client to disconnect after
    /// [`SessionManager::stop`].
    ///
    /// On timeout the transfers of remaining sessions are cancelled and
    /// `SessionTimeout` is returned.
    pub async fn wait_gracefully(&self, timeout: Duration) -> Result<()> {
        let mut state = self.connections.subscribe();
        let drained = tokio::time::timeout(timeout, async {
            state
                .wait_for(|s| s.stopping && s.active == 0)
                .await
                .map(|_| ())
        })
        .await;
        match drained {
            Ok(_) => {
                info!("all clients disconnected");
                Ok(())
            }
            Err(_) => {
                warn!(active = self.active_connections(), "graceful shutdown timed out");
                self.auth.shutdown.cancel();
                Err(FsError::SessionTimeout { waited: timeout })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Role, StaticPolicy, StaticRoles};
    use crate::index::PathIndex;
    use crate::rate_limit::{DEFAULT_CHUNK_SIZE, RateLimiterRegistry};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Credentials {
        verified: AtomicUsize,
        reset: AtomicI64,
    }

    #[async_trait]
    impl CredentialStore for Credentials {
        async fn verify(&self, user: &str, password: &str) -> Result<Account> {
            self.verified.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if password == "secret" {
                Ok(Account { id: 1, name: user.to_string() })
            } else {
                Err(FsError::Authentication("bad password".into()))
            }
        }

        async fn last_token_reset(&self, _user_id: i64) -> Result<i64> {
            Ok(self.reset.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct Audit {
        records: Mutex<Vec<LoginRecord>>,
    }

    #[async_trait]
    impl AuditSink for Audit {
        async fn record(&self, record: LoginRecord) -> Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        credentials: Arc<Credentials>,
        audit: Arc<Audit>,
        manager: SessionManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(PathIndex::in_memory(dir.path()));
        let roles = Arc::new(StaticRoles::new());
        roles.assign("alice", Role { key: "editor".into(), name: "Editor".into() });
        let ctx = Arc::new(FsContext::new(
            index,
            Arc::new(StaticPolicy::new()),
            roles,
            Arc::new(RateLimiterRegistry::new(Duration::from_secs(60), DEFAULT_CHUNK_SIZE)),
            ".tmp",
            Duration::from_secs(60),
        ));
        let credentials = Arc::new(Credentials::default());
        let audit = Arc::new(Audit::default());
        let config = SessionConfig {
            jwt_secret: "test-secret".into(),
            ..SessionConfig::default()
        };
        let manager = SessionManager::new(
            ctx,
            Arc::clone(&credentials) as Arc<dyn CredentialStore>,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            "admin",
            &config,
        );
        Fixture {
            _dir: dir,
            credentials,
            audit,
            manager,
        }
    }

    async fn settle_audit(audit: &Audit, expected: usize) {
        for _ in 0..50 {
            if audit.records.lock().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn session_key_hides_password() {
        let key = session_key("alice", "secret");
        assert_eq!(key.len(), 64);
        assert!(!key.contains("secret"));
        assert_ne!(key, session_key("alice", "secret2"));
        assert_ne!(session_key("ab", "c"), session_key("a", "bc"));
    }

    #[test]
    fn tokens_round_trip() {
        let issuer = TokenIssuer::new(b"k", Duration::from_secs(60));
        let identity = Identity {
            user_id: 9,
            name: "bob".into(),
            role_key: "viewer".into(),
            privileged: false,
        };
        let (token, claims) = issuer.issue(&identity).unwrap();
        assert_eq!(issuer.verify(&token).unwrap(), claims);
        assert_eq!(claims.sub, "9");
        assert!(TokenIssuer::new(b"other", Duration::from_secs(60)).verify(&token).is_err());
    }

    #[tokio::test]
    async fn concurrent_logins_hit_the_store_once() {
        let fx = fixture();
        let (a, b) = tokio::join!(
            fx.manager.authenticate("alice", "secret", "10.0.0.1:5000"),
            fx.manager.authenticate("alice", "secret", "10.0.0.2:5000"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.identity.role_key, "editor");
        assert_eq!(fx.credentials.verified.load(Ordering::SeqCst), 1);

        settle_audit(&fx.audit, 2).await;
        let records = fx.audit.records.lock();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.outcome == LoginOutcome::Success && r.channel == "ftp"));
    }

    #[tokio::test]
    async fn cached_session_is_reused_until_reset() {
        let fx = fixture();
        let first = fx.manager.authenticate("alice", "secret", "a").await.unwrap();
        let second = fx.manager.authenticate("alice", "secret", "a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.credentials.verified.load(Ordering::SeqCst), 1);

        fx.credentials.reset.store(first.claims.iat, Ordering::SeqCst);
        let third = fx.manager.authenticate("alice", "secret", "a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(fx.credentials.verified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_audited_and_not_cached() {
        let fx = fixture();
        let err = fx.manager.authenticate("alice", "wrong", "a").await.unwrap_err();
        assert!(matches!(err, FsError::Authentication(_)));
        assert_eq!(err.ftp_reply(), 530);
        assert_eq!(fx.manager.cached_sessions(), 0);

        fx.manager.authenticate("alice", "wrong", "a").await.unwrap_err();
        assert_eq!(fx.credentials.verified.load(Ordering::SeqCst), 2);

        settle_audit(&fx.audit, 2).await;
        assert!(fx.audit.records.lock().iter().all(|r| r.outcome == LoginOutcome::Failure));
    }

    #[tokio::test]
    async fn account_without_role_is_denied() {
        let fx = fixture();
        let err = fx.manager.authenticate("mallory", "secret", "a").await.unwrap_err();
        assert!(matches!(err, FsError::AuthorizationDenied { ref path } if path == "no directory permission"));
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_login() {
        let fx = fixture();
        fx.manager.authenticate("alice", "secret", "a").await.unwrap();
        assert!(fx.manager.invalidate(&session_key("alice", "secret")));
        fx.manager.authenticate("alice", "secret", "a").await.unwrap();
        assert_eq!(fx.credentials.verified.load(Ordering::SeqCst), 2);

        fx.manager.invalidate_user(1);
        assert_eq!(fx.manager.cached_sessions(), 0);
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_clients() {
        let fx = fixture();
        assert_eq!(fx.manager.client_connected(), "filegate ftp service");
        fx.manager.client_connected();
        assert_eq!(fx.manager.active_connections(), 2);
        fx.manager.stop();

        let manager = Arc::new(fx.manager);
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_gracefully(Duration::from_secs(5)).await })
        };
        manager.client_disconnected();
        manager.client_disconnected();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_times_out() {
        let fx = fixture();
        fx.manager.client_connected();
        fx.manager.stop();
        let err = fx.manager.wait_gracefully(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FsError::SessionTimeout { .. }));
    }

    #[tokio::test]
    async fn wait_without_stop_does_not_complete() {
        let fx = fixture();
        let err = fx
            .manager
            .wait_gracefully(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::SessionTimeout { .. }));
    }
}
