//! Authentication gateway
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-2 (Account Management),
//! AC-3 (Access Enforcement), AC-6 (Least Privilege)
//! Implementation: Login through the directory client, group to role mapping,
//! TTL cache of resolved principals, and operation authorization.

use crate::config::DirectoryConfig;
use crate::directory::{DirectoryAttributes, DirectoryClient};
use crate::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File search operation
pub const OP_SEARCH: &str = "search";
/// Content search operation
pub const OP_CONTENT_SEARCH: &str = "content-search";
/// Download operation
pub const OP_DOWNLOAD: &str = "download";
/// Upload operation
pub const OP_UPLOAD: &str = "upload";

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Login identity
    pub identity: String,
    /// Display name
    pub display_name: String,
    /// Email address
    pub email: String,
    /// Department
    pub department: String,
    /// Group memberships in directory order
    pub groups: Vec<String>,
    /// Resolved application roles
    pub roles: BTreeSet<String>,
}

/// Group and role policy
///
/// NIST 800-53: AC-6 (Least Privilege)
#[derive(Debug, Clone)]
pub struct RolePolicy {
    group_roles: Vec<(String, Vec<String>)>,
    role_permissions: BTreeMap<String, BTreeSet<String>>,
    admin_role: String,
}

impl RolePolicy {
    /// Build from directory configuration
    pub fn new(config: &DirectoryConfig) -> Self {
        Self {
            group_roles: config
                .group_role_mappings
                .iter()
                .map(|(group, roles)| (group.to_lowercase(), roles.clone()))
                .collect(),
            role_permissions: config
                .role_permissions
                .iter()
                .map(|(role, ops)| (role.clone(), ops.iter().cloned().collect()))
                .collect(),
            admin_role: config.admin_role.clone(),
        }
    }

    /// Role that grants every operation
    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    /// Roles granted by the longest mapping key matching `group`
    ///
    /// A key matches the full group DN or its first `CN=` component,
    /// case-insensitively.
    fn roles_for_group(&self, group: &str) -> Option<&[String]> {
        let full = group.trim().to_lowercase();
        let cn = common_name(&full);

        self.group_roles
            .iter()
            .filter(|(key, _)| *key == full || cn.is_some_and(|cn| key == cn))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, roles)| roles.as_slice())
    }

    fn permissions_of(&self, role: &str) -> Option<&BTreeSet<String>> {
        self.role_permissions.get(role)
    }

    /// Map directory groups to the effective role set
    ///
    /// Roles whose permissions are covered by another held role are dropped;
    /// the administrative role covers every other role.
    pub fn resolve_roles(&self, groups: &[String]) -> BTreeSet<String> {
        let held: BTreeSet<String> = groups
            .iter()
            .filter_map(|g| self.roles_for_group(g))
            .flatten()
            .cloned()
            .collect();

        if held.contains(&self.admin_role) {
            return BTreeSet::from([self.admin_role.clone()]);
        }

        let empty = BTreeSet::new();
        held.iter()
            .filter(|role| {
                let mine = self.permissions_of(role).unwrap_or(&empty);
                !held.iter().any(|other| {
                    if other == *role {
                        return false;
                    }
                    let theirs = self.permissions_of(other).unwrap_or(&empty);
                    mine.is_subset(theirs) && (mine.len() < theirs.len() || other < *role)
                })
            })
            .cloned()
            .collect()
    }

    /// Whether any of `roles` grants `operation`
    ///
    /// Operations are compared byte for byte.
    pub fn grants<S: AsRef<str>>(&self, roles: &[S], operation: &str) -> bool {
        roles.iter().any(|role| {
            let role = role.as_ref();
            role == self.admin_role
                || self
                    .permissions_of(role)
                    .is_some_and(|ops| ops.contains(operation))
        })
    }

    /// Operations granted to `roles`, sorted
    pub fn permissions<S: AsRef<str>>(&self, roles: &[S]) -> Vec<String> {
        let is_admin = roles.iter().any(|r| r.as_ref() == self.admin_role);
        let ops: BTreeSet<&String> = if is_admin {
            self.role_permissions.values().flatten().collect()
        } else {
            roles
                .iter()
                .filter_map(|r| self.permissions_of(r.as_ref()))
                .flatten()
                .collect()
        };
        ops.into_iter().cloned().collect()
    }
}

fn common_name(dn: &str) -> Option<&str> {
    let first = dn.split(',').next()?.trim();
    first.strip_prefix("cn=").map(str::trim)
}

#[derive(Debug, Clone)]
struct CachedPrincipal {
    principal: Principal,
    expires_at: Instant,
}

/// Login orchestration and authorization
pub struct AuthenticationGateway {
    directory: Arc<dyn DirectoryClient>,
    policy: RolePolicy,
    cache: DashMap<String, CachedPrincipal>,
    cache_ttl: Duration,
}

impl AuthenticationGateway {
    /// Create a gateway over a directory client
    pub fn new(directory: Arc<dyn DirectoryClient>, config: &DirectoryConfig) -> Self {
        Self {
            directory,
            policy: RolePolicy::new(config),
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    /// Role policy in force
    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    fn cache_key(identity: &str) -> String {
        identity.trim().to_lowercase()
    }

    fn principal_from(&self, identity: &str, attrs: DirectoryAttributes) -> Principal {
        let roles = self.policy.resolve_roles(&attrs.groups);
        Principal {
            identity: identity.to_string(),
            display_name: attrs.display_name,
            email: attrs.email,
            department: attrs.department,
            groups: attrs.groups,
            roles,
        }
    }

    fn remember(&self, principal: &Principal) {
        self.cache.insert(
            Self::cache_key(&principal.identity),
            CachedPrincipal {
                principal: principal.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }

    fn cached(&self, identity: &str) -> Option<Principal> {
        let key = Self::cache_key(identity);
        let now = Instant::now();
        let hit = self
            .cache
            .get(&key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.principal.clone());
        if hit.is_none() {
            self.cache.remove_if(&key, |_, c| c.expires_at <= now);
        }
        hit
    }

    /// Verify credentials against the directory
    ///
    /// # NIST 800-53: IA-2 (Identification and Authentication)
    ///
    /// # Errors
    ///
    /// `Error::AuthFailure` for blank input, unknown identities and rejected
    /// secrets; `Error::Directory` for service failures, which clients see as
    /// the same generic failure
    pub async fn authenticate(&self, identity: &str, secret: &str) -> Result<Principal> {
        let identity = identity.trim();
        if identity.is_empty() || secret.is_empty() {
            return Err(Error::AuthFailure("blank identity or secret".to_string()));
        }

        let dn = self
            .directory
            .resolve_identity(identity)
            .await
            .inspect_err(|e| {
                warn!(
                    event = "directory_error",
                    stage = "resolve",
                    error = %e,
                    "Directory lookup failed"
                );
            })?
            .ok_or_else(|| Error::AuthFailure(format!("unknown identity {identity}")))?;

        let accepted = self
            .directory
            .bind_as(&dn, secret)
            .await
            .inspect_err(|e| {
                warn!(
                    event = "directory_error",
                    stage = "bind",
                    error = %e,
                    "Directory bind failed"
                );
            })?;
        if !accepted {
            return Err(Error::AuthFailure(format!("credentials rejected for {dn}")));
        }

        let attrs = self
            .directory
            .fetch_attributes(&dn)
            .await
            .inspect_err(|e| {
                warn!(
                    event = "directory_error",
                    stage = "attributes",
                    error = %e,
                    "Attribute lookup failed"
                );
            })?;

        let principal = self.principal_from(identity, attrs);
        self.remember(&principal);

        info!(
            event = "principal_resolved",
            identity = %principal.identity,
            roles = ?principal.roles,
            "Directory authentication succeeded"
        );
        Ok(principal)
    }

    /// Principal for `identity`, from cache or the directory
    ///
    /// # Errors
    ///
    /// `Error::AuthFailure` for unknown identities, `Error::Directory` for
    /// service failures
    pub async fn principal(&self, identity: &str) -> Result<Principal> {
        if let Some(principal) = self.cached(identity) {
            return Ok(principal);
        }
        debug!(identity, "Principal cache miss");

        let dn = self
            .directory
            .resolve_identity(identity)
            .await?
            .ok_or_else(|| Error::AuthFailure(format!("unknown identity {identity}")))?;
        let attrs = self.directory.fetch_attributes(&dn).await?;
        let principal = self.principal_from(identity.trim(), attrs);
        self.remember(&principal);
        Ok(principal)
    }

    /// Whether `identity` may perform `operation`
    ///
    /// # NIST 800-53: AC-3 (Access Enforcement)
    ///
    /// # Errors
    ///
    /// Lookup errors from [`Self::principal`]
    pub async fn is_authorized(&self, identity: &str, operation: &str) -> Result<bool> {
        let principal = self.principal(identity).await?;
        let roles: Vec<&String> = principal.roles.iter().collect();
        Ok(self.policy.grants(&roles, operation))
    }

    /// Drop every cached principal
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Drop expired cache entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, c| c.expires_at > now);
        before.saturating_sub(self.cache.len())
    }

    /// Cached principals
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
