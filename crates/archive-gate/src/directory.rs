//! Directory service clients
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-2 (Account Management)
//! Implementation: Narrow interface over the identity provider. Secrets are
//! only forwarded for a bind; nothing here stores them.

use crate::config::{DirectoryConfig, StaticUser};
use crate::{Error, Result};
use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, ldap_escape};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// LDAP result code for rejected credentials
const LDAP_INVALID_CREDENTIALS: u32 = 49;

/// Attributes looked up for an authenticated user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryAttributes {
    /// Display name
    pub display_name: String,
    /// Email address
    pub email: String,
    /// Department
    pub department: String,
    /// Group memberships in directory order (DN or plain name)
    pub groups: Vec<String>,
}

/// Identity provider operations used by the authentication gateway
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Resolve a login identity to its distinguished name
    ///
    /// `Ok(None)` when the identity is unknown or ambiguous.
    async fn resolve_identity(&self, identity: &str) -> Result<Option<String>>;

    /// Check `secret` by binding as `dn`
    ///
    /// `Ok(false)` for rejected credentials; `Err` only for service failures.
    async fn bind_as(&self, dn: &str, secret: &str) -> Result<bool>;

    /// Fetch profile attributes and group memberships for `dn`
    async fn fetch_attributes(&self, dn: &str) -> Result<DirectoryAttributes>;
}

/// LDAP / Active Directory backend
pub struct LdapDirectory {
    url: String,
    search_base: String,
    search_filter: String,
    service_bind: Option<(String, String)>,
    connect_timeout: Duration,
    read_timeout: Duration,
    attributes: [String; 4],
}

impl LdapDirectory {
    /// Build from configuration; no connection is made until first use
    pub fn new(config: &DirectoryConfig) -> Self {
        let search_base = if config.search_base.is_empty() {
            config.base_dn.clone()
        } else {
            config.search_base.clone()
        };
        let service_bind = match (&config.bind_dn, &config.bind_password) {
            (Some(dn), Some(password)) => Some((dn.clone(), password.clone())),
            _ => None,
        };

        Self {
            url: config.url.clone(),
            search_base,
            search_filter: config.search_filter.clone(),
            service_bind,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            read_timeout: Duration::from_secs(config.read_timeout_secs.max(1)),
            attributes: [
                config.display_name_attribute.clone(),
                config.email_attribute.clone(),
                config.department_attribute.clone(),
                config.group_attribute.clone(),
            ],
        }
    }

    /// User filter with the identity escaped for LDAP
    fn filter_for(&self, identity: &str) -> String {
        self.search_filter.replace("{0}", &ldap_escape(identity))
    }

    async fn connect(&self) -> Result<ldap3::Ldap> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.url).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(event = "directory_connection_error", error = %e, "LDAP connection ended");
            }
        });
        Ok(ldap)
    }

    /// Connect and bind with the service account when one is configured
    async fn service_connection(&self) -> Result<ldap3::Ldap> {
        let mut ldap = self.connect().await?;
        if let Some((dn, password)) = &self.service_bind {
            ldap.with_timeout(self.read_timeout)
                .simple_bind(dn, password)
                .await?
                .success()?;
        }
        Ok(ldap)
    }
}

#[async_trait]
impl DirectoryClient for LdapDirectory {
    async fn resolve_identity(&self, identity: &str) -> Result<Option<String>> {
        let mut ldap = self.service_connection().await?;
        let filter = self.filter_for(identity);
        let (entries, _) = ldap
            .with_timeout(self.read_timeout)
            .search(&self.search_base, Scope::Subtree, &filter, vec!["1.1"])
            .await?
            .success()?;
        let _ = ldap.unbind().await;

        match entries.len() {
            1 => {
                let dn = entries
                    .into_iter()
                    .next()
                    .map(|e| SearchEntry::construct(e).dn);
                debug!(dn = ?dn, "Resolved directory identity");
                Ok(dn)
            }
            0 => Ok(None),
            n => {
                warn!(
                    event = "directory_ambiguous_identity",
                    matches = n,
                    "Identity filter matched several entries"
                );
                Ok(None)
            }
        }
    }

    async fn bind_as(&self, dn: &str, secret: &str) -> Result<bool> {
        // An empty password is an unauthenticated bind that many servers accept
        if secret.is_empty() {
            return Ok(false);
        }
        let mut ldap = self.connect().await?;
        let result = ldap
            .with_timeout(self.read_timeout)
            .simple_bind(dn, secret)
            .await?;
        let _ = ldap.unbind().await;

        match result.rc {
            0 => Ok(true),
            LDAP_INVALID_CREDENTIALS => Ok(false),
            rc => Err(Error::Directory(format!("bind returned rc={rc}: {}", result.text))),
        }
    }

    async fn fetch_attributes(&self, dn: &str) -> Result<DirectoryAttributes> {
        let mut ldap = self.service_connection().await?;
        let requested: Vec<&str> = self.attributes.iter().map(String::as_str).collect();
        let (entries, _) = ldap
            .with_timeout(self.read_timeout)
            .search(dn, Scope::Base, "(objectClass=*)", requested)
            .await?
            .success()?;
        let _ = ldap.unbind().await;

        let entry = entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| Error::Directory(format!("no entry for {dn}")))?;

        let first = |name: &str| {
            entry
                .attrs
                .get(name)
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_default()
        };

        Ok(DirectoryAttributes {
            display_name: first(&self.attributes[0]),
            email: first(&self.attributes[1]),
            department: first(&self.attributes[2]),
            groups: entry.attrs.get(&self.attributes[3]).cloned().unwrap_or_default(),
        })
    }
}

/// In-process directory for development and tests
///
/// Holds SHA-256 hex digests; never plaintext secrets.
pub struct StaticDirectory {
    users: HashMap<String, StaticUser>,
}

impl StaticDirectory {
    /// Build from configured users
    pub fn new(users: &[StaticUser]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (Self::dn_for(&u.identity), u.clone()))
                .collect(),
        }
    }

    fn dn_for(identity: &str) -> String {
        format!("uid={},ou=static", identity.trim().to_lowercase())
    }

    /// Hex SHA-256 of a secret, as stored in `secret_sha256`
    pub fn digest(secret: &str) -> String {
        hex::encode(Sha256::digest(secret.as_bytes()))
    }
}

#[async_trait]
impl DirectoryClient for StaticDirectory {
    async fn resolve_identity(&self, identity: &str) -> Result<Option<String>> {
        let dn = Self::dn_for(identity);
        Ok(self.users.contains_key(&dn).then_some(dn))
    }

    async fn bind_as(&self, dn: &str, secret: &str) -> Result<bool> {
        if secret.is_empty() {
            return Ok(false);
        }
        let Some(user) = self.users.get(dn) else {
            return Ok(false);
        };
        let presented = Self::digest(secret);
        let stored = user.secret_sha256.to_ascii_lowercase();
        Ok(presented.as_bytes().ct_eq(stored.as_bytes()).into())
    }

    async fn fetch_attributes(&self, dn: &str) -> Result<DirectoryAttributes> {
        let user = self
            .users
            .get(dn)
            .ok_or_else(|| Error::Directory(format!("no entry for {dn}")))?;
        Ok(DirectoryAttributes {
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            department: user.department.clone(),
            groups: user.groups.clone(),
        })
    }
}
