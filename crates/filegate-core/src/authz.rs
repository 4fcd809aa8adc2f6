//! Identities and the authorization seams.
//!
//! The policy store and the role directory live outside this crate. They are
//! reached through [`Authorizer`] and [`RoleStore`]. [`StaticPolicy`] and
//! [`StaticRoles`] are in-memory implementations for tests and the CLI.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

/// Prefix of every filesystem resource handed to the authorizer.
pub const RESOURCE_PREFIX: &str = "/api/v1/fs";

/// The four authorization actions, named after their HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Read,
    Write,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Read, Action::Write, Action::Update, Action::Delete];

    pub fn method(self) -> &'static str {
        match self {
            Self::Read => "GET",
            Self::Write => "POST",
            Self::Update => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Builds the resource string for a decoded relative path.
pub fn resource_for(relative: &str) -> String {
    format!("{RESOURCE_PREFIX}/{relative}")
}

/// An account as returned by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub key: String,
    pub name: String,
}

/// Who is calling. Privileged identities bypass the authorizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub name: String,
    pub role_key: String,
    pub privileged: bool,
}

impl Identity {
    /// Builds the identity for `account` in `role`; `admin_role` is privileged.
    pub fn new(account: &Account, role: &Role, admin_role: &str) -> Self {
        Self {
            user_id: account.id,
            name: account.name.clone(),
            role_key: role.key.clone(),
            privileged: role.key == admin_role,
        }
    }

    /// Key used for per-identity rate limiters.
    pub fn limiter_key(&self) -> String {
        format!("{}-{}", self.name, self.role_key)
    }
}

/// Policy decisions for filesystem resources.
///
/// The subject is the identity's role key.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn enforce(&self, subject: &str, resource: &str, action: Action) -> Result<bool>;

    /// Resource patterns `subject` may use with `action`.
    async fn permitted_resources(&self, subject: &str, action: Action) -> Result<Vec<String>>;
}

/// Role lookup and per-role transfer rates.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn role_for(&self, account: &Account) -> Result<Option<Role>>;

    /// Bytes per second for `role_key`; zero means unlimited.
    async fn rate_limit(&self, role_key: &str) -> Result<u64>;
}

struct Rule {
    pattern: String,
    matcher: Regex,
    actions: Vec<Action>,
}

/// Regex rules per role.
///
/// A pattern must match the whole resource. A pattern ending in `/.*` also
/// matches the directory it names, so `/api/v1/fs/photos/.*` grants
/// `/api/v1/fs/photos` itself.
#[derive(Default)]
pub struct StaticPolicy {
    rules: RwLock<HashMap<String, Vec<Rule>>>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, role: &str, pattern: &str, actions: &[Action]) -> Result<()> {
        let anchored = match pattern.strip_suffix("/.*") {
            Some(dir) => format!("^(?:{dir})(?:/.*)?$"),
            None => format!("^(?:{pattern})$"),
        };
        let matcher = Regex::new(&anchored)
            .map_err(|e| FsError::InvalidInput(format!("invalid policy pattern {pattern:?}: {e}")))?;
        self.rules.write().entry(role.to_string()).or_default().push(Rule {
            pattern: pattern.to_string(),
            matcher,
            actions: actions.to_vec(),
        });
        Ok(())
    }

    /// Builder form of [`StaticPolicy::allow`].
    pub fn with_rule(self, role: &str, pattern: &str, actions: &[Action]) -> Result<Self> {
        self.allow(role, pattern, actions)?;
        Ok(self)
    }
}

#[async_trait]
impl Authorizer for StaticPolicy {
    async fn enforce(&self, subject: &str, resource: &str, action: Action) -> Result<bool> {
        let rules = self.rules.read();
        Ok(rules.get(subject).is_some_and(|rules| {
            rules
                .iter()
                .any(|r| r.actions.contains(&action) && r.matcher.is_match(resource))
        }))
    }

    async fn permitted_resources(&self, subject: &str, action: Action) -> Result<Vec<String>> {
        let rules = self.rules.read();
        Ok(rules
            .get(subject)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.actions.contains(&action))
                    .map(|r| r.pattern.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Fixed account-to-role assignments and role rates.
#[derive(Default)]
pub struct StaticRoles {
    roles: RwLock<HashMap<String, Role>>,
    rates: RwLock<HashMap<String, u64>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, account: &str, role: Role) {
        self.roles.write().insert(account.to_string(), role);
    }

    pub fn set_rate(&self, role_key: &str, bytes_per_second: u64) {
        self.rates.write().insert(role_key.to_string(), bytes_per_second);
    }
}

#[async_trait]
impl RoleStore for StaticRoles {
    async fn role_for(&self, account: &Account) -> Result<Option<Role>> {
        Ok(self.roles.read().get(&account.name).cloned())
    }

    async fn rate_limit(&self, role_key: &str) -> Result<u64> {
        Ok(self.rates.read().get(role_key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_patterns_cover_the_directory_itself() {
        let policy = StaticPolicy::new()
            .with_rule("editor", "/api/v1/fs/photos/.*", &[Action::Read, Action::Write])
            .unwrap();
        assert!(policy.enforce("editor", "/api/v1/fs/photos", Action::Read).await.unwrap());
        assert!(policy.enforce("editor", "/api/v1/fs/photos/a.jpg", Action::Write).await.unwrap());
        assert!(!policy.enforce("editor", "/api/v1/fs/photos2", Action::Read).await.unwrap());
        assert!(!policy.enforce("editor", "/api/v1/fs/photos/a.jpg", Action::Delete).await.unwrap());
        assert!(!policy.enforce("viewer", "/api/v1/fs/photos", Action::Read).await.unwrap());
    }

    #[tokio::test]
    async fn permitted_resources_filters_by_action() {
        let policy = StaticPolicy::new()
            .with_rule("editor", "/api/v1/fs/photos/.*", &[Action::Read])
            .unwrap()
            .with_rule("editor", "/api/v1/fs/drop/.*", &[Action::Write])
            .unwrap();
        assert_eq!(
            policy.permitted_resources("editor", Action::Read).await.unwrap(),
            vec!["/api/v1/fs/photos/.*".to_string()]
        );
        assert!(policy.permitted_resources("nobody", Action::Read).await.unwrap().is_empty());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(StaticPolicy::new().allow("r", "(", &[Action::Read]).is_err());
    }

    #[test]
    fn admin_role_is_privileged() {
        let account = Account { id: 1, name: "root".into() };
        let admin = Role { key: "admin".into(), name: "Admin".into() };
        let editor = Role { key: "editor".into(), name: "Editor".into() };
        assert!(Identity::new(&account, &admin, "admin").privileged);
        assert!(!Identity::new(&account, &editor, "admin").privileged);
        assert_eq!(Identity::new(&account, &editor, "admin").limiter_key(), "root-editor");
    }

    #[test]
    fn actions_map_to_methods() {
        assert_eq!(Action::Read.to_string(), "GET");
        assert_eq!(Action::Write.method(), "POST");
        assert_eq!(Action::Update.method(), "PUT");
        assert_eq!(Action::Delete.method(), "DELETE");
    }
}
