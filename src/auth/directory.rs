//! Identity and role data sources.
//!
//! Session issuance and the user/project/role tables belong to the wider
//! platform.  The gateway only needs two lookups from them, expressed as the
//! [`IdentityResolver`] and [`RoleSource`] traits.  [`Directory`] is the
//! in-memory form of that data; [`FileDirectory`] re-reads it from a YAML
//! document on every lookup so edits take effect without a restart.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Durable user identity resolved from a short-lived session token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 digest, safe to put in logs.
    pub fn digest(&self) -> String {
        short_digest(&self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.digest())
    }
}

/// First 12 hex characters of the SHA-256 of `secret`.
pub fn short_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(12);
    hex
}

// ---------------------------------------------------------------------------
// Permissions and roles
// ---------------------------------------------------------------------------

/// A `(resource, action)` pair, written `resource:action`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub const READ: &'static str = "read";

    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub fn code_read() -> Self {
        Self::new("code", "read")
    }

    pub fn code_write() -> Self {
        Self::new("code", "write")
    }

    pub fn code_create() -> Self {
        Self::new("code", "create")
    }

    pub fn is_read(&self) -> bool {
        self.action == Self::READ
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((resource, action)) if !resource.is_empty() && !action.is_empty() => {
                Ok(Self::new(resource, action))
            }
            _ => Err(format!("permission {s:?} is not of the form resource:action")),
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Role {
    pub name: String,
    /// Higher level takes precedence when several memberships are active.
    pub level: i64,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Parent roles whose permissions this role also receives.
    #[serde(default)]
    pub inherits: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub token: String,
    pub identity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Membership {
    pub identity: String,
    pub project: String,
    pub role: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Map a session token to its identity.  Must be consulted per request.
    async fn resolve_session(&self, session: &str) -> Result<Option<Identity>>;
}

#[async_trait]
pub trait RoleSource: Send + Sync {
    /// Every active role `identity` holds on `project`.
    async fn active_roles(&self, identity: &Identity, project: &str) -> Result<Vec<Role>>;
    /// Role definition by name.
    async fn role(&self, name: &str) -> Result<Option<Role>>;
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

impl Directory {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse identity directory")
    }

    fn find_role(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }
}

#[async_trait]
impl IdentityResolver for Directory {
    async fn resolve_session(&self, session: &str) -> Result<Option<Identity>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.token == session)
            .map(|s| Identity::new(s.identity.clone())))
    }
}

#[async_trait]
impl RoleSource for Directory {
    async fn active_roles(&self, identity: &Identity, project: &str) -> Result<Vec<Role>> {
        Ok(self
            .memberships
            .iter()
            .filter(|m| m.active && m.identity == identity.as_str() && m.project == project)
            .filter_map(|m| self.find_role(&m.role).cloned())
            .collect())
    }

    async fn role(&self, name: &str) -> Result<Option<Role>> {
        Ok(self.find_role(name).cloned())
    }
}

// ---------------------------------------------------------------------------
// File-backed directory
// ---------------------------------------------------------------------------

/// Reads the YAML directory from disk on every lookup.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Directory> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read identity directory {}", self.path.display()))?;
        Directory::from_yaml(&text)
            .with_context(|| format!("in {}", self.path.display()))
    }
}

#[async_trait]
impl IdentityResolver for FileDirectory {
    async fn resolve_session(&self, session: &str) -> Result<Option<Identity>> {
        self.load().await?.resolve_session(session).await
    }
}

#[async_trait]
impl RoleSource for FileDirectory {
    async fn active_roles(&self, identity: &Identity, project: &str) -> Result<Vec<Role>> {
        self.load().await?.active_roles(identity, project).await
    }

    async fn role(&self, name: &str) -> Result<Option<Role>> {
        self.load().await?.role(name).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
