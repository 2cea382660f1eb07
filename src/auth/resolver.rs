//! Role-based permission resolution.
//!
//! Decision order for `(identity, project, permission)`:
//!
//! 1. Pick the authoritative active role: highest `level`, ties broken by the
//!    lexicographically smallest name.  No role means deny.
//! 2. The owner role is allowed everything.
//! 3. The guest role is denied every non-read action, whatever it was granted.
//! 4. Otherwise allow iff the permission is attached to the role or to any
//!    role reachable through `inherits`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument};

use super::directory::{Identity, Permission, Role, RoleSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NoRole,
    Owner,
    GuestNonRead,
    Granted,
    NotGranted,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoRole => "no active role on project",
            Self::Owner => "owner role",
            Self::GuestNonRead => "guest role may only read",
            Self::Granted => "permission granted",
            Self::NotGranted => "permission not granted",
        })
    }
}

/// Outcome of one authorization check.  Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub role: Option<String>,
    pub reason: DecisionReason,
}

impl PermissionDecision {
    fn new(allowed: bool, role: Option<&Role>, reason: DecisionReason) -> Self {
        Self {
            allowed,
            role: role.map(|r| r.name.clone()),
            reason,
        }
    }
}

pub struct PermissionResolver {
    roles: Arc<dyn RoleSource>,
    owner_role: String,
    guest_role: String,
}

impl PermissionResolver {
    pub fn new(
        roles: Arc<dyn RoleSource>,
        owner_role: impl Into<String>,
        guest_role: impl Into<String>,
    ) -> Self {
        Self {
            roles,
            owner_role: owner_role.into(),
            guest_role: guest_role.into(),
        }
    }

    #[instrument(skip(self, identity, permission), fields(identity = %identity.digest(), %permission))]
    pub async fn authorize(
        &self,
        identity: &Identity,
        project: &str,
        permission: &Permission,
    ) -> Result<PermissionDecision> {
        let candidates = self.roles.active_roles(identity, project).await?;
        let Some(role) = authoritative_role(candidates) else {
            debug!("no active role");
            return Ok(PermissionDecision::new(false, None, DecisionReason::NoRole));
        };

        if role.name == self.owner_role {
            return Ok(PermissionDecision::new(true, Some(&role), DecisionReason::Owner));
        }
        if role.name == self.guest_role && !permission.is_read() {
            return Ok(PermissionDecision::new(
                false,
                Some(&role),
                DecisionReason::GuestNonRead,
            ));
        }

        let granted = self.grants(&role, permission).await?;
        let reason = if granted {
            DecisionReason::Granted
        } else {
            DecisionReason::NotGranted
        };
        debug!(role = %role.name, allowed = granted, "resolved");
        Ok(PermissionDecision::new(granted, Some(&role), reason))
    }

    /// Breadth-first walk of the inheritance relation.  Each role is visited
    /// once, so cycles terminate.
    async fn grants(&self, start: &Role, permission: &Permission) -> Result<bool> {
        let mut seen: HashSet<String> = HashSet::from([start.name.clone()]);
        let mut queue: VecDeque<Role> = VecDeque::from([start.clone()]);

        while let Some(role) = queue.pop_front() {
            if role.permissions.contains(permission) {
                return Ok(true);
            }
            for parent in &role.inherits {
                if !seen.insert(parent.clone()) {
                    continue;
                }
                match self.roles.role(parent).await? {
                    Some(def) => queue.push_back(def),
                    None => debug!(role = %role.name, %parent, "inherited role is not defined"),
                }
            }
        }
        Ok(false)
    }
}

/// Highest level wins; equal levels go to the smallest name.
fn authoritative_role(candidates: Vec<Role>) -> Option<Role> {
    candidates
        .into_iter()
        .min_by(|a, b| b.level.cmp(&a.level).then_with(|| a.name.cmp(&b.name)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
